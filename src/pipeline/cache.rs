//! Single-slot latest-frame cache for live preview

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::capture::Frame;

/// Holds the most recently published frame.
///
/// Publishing swaps a pointer, so readers never see a half-written frame and
/// the capture thread never waits on a slow viewer.
#[derive(Debug, Default)]
pub struct LatestFrameCache {
    slot: ArcSwapOption<Frame>,
}

impl LatestFrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        self.slot.store(Some(Arc::new(frame)));
    }

    /// A copy of the cached frame, if any.
    pub fn peek(&self) -> Option<Frame> {
        self.slot.load_full().map(|frame| Frame::clone(&frame))
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }
}
