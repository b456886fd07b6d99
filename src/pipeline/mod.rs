pub mod cache;
pub mod capture_loop;
pub mod session;
pub mod stats;

pub use cache::LatestFrameCache;
pub use capture_loop::{SessionReport, SessionState, StreamSession, StreamSettings};
pub use session::StreamManager;
pub use stats::{CaptureStats, StatsSnapshot};
