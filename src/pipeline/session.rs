//! Session control keyed by camera serial number

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use super::capture_loop::{SessionReport, SessionState, StreamSession, StreamSettings};
use crate::capture::{CameraDriver, Frame};
use crate::error::CaptureError;
use crate::sink::SinkLauncher;
use crate::Config;

enum Slot {
    /// Camera being opened; the lock is not held meanwhile
    Starting,
    Active(StreamSession),
    /// Capture thread being joined and resources released
    Stopping,
}

/// Starts and stops at most one stream per camera.
///
/// `start` and `stop` are idempotent: repeating either is a logged no-op.
/// The session table lock is never held across opening, joining or
/// flushing, so viewers polling [`StreamManager::get_frame`] never wait on
/// the camera.
pub struct StreamManager<D: CameraDriver, L: SinkLauncher> {
    driver: D,
    launcher: L,
    config: Config,
    sessions: Mutex<HashMap<String, Slot>>,
}

impl<D: CameraDriver, L: SinkLauncher> StreamManager<D, L> {
    pub fn new(driver: D, launcher: L, config: Config) -> Self {
        Self {
            driver,
            launcher,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start streaming `identifier`. Open failures are returned after the
    /// retry policy is exhausted; a second start is a no-op.
    ///
    /// A session whose capture thread died on a sink failure is not running:
    /// it is torn down, its error logged, and a fresh session started.
    pub fn start(&self, identifier: &str) -> Result<(), CaptureError> {
        let failed = {
            let mut sessions = self.sessions();
            let failed = match sessions.remove(identifier) {
                Some(Slot::Active(session)) if session.state() == SessionState::Failed => {
                    Some(session)
                }
                Some(slot) => {
                    sessions.insert(identifier.to_string(), slot);
                    warn!(camera = %identifier, "Stream already running, start ignored");
                    return Ok(());
                }
                None => None,
            };
            sessions.insert(identifier.to_string(), Slot::Starting);
            failed
        };

        if let Some(session) = failed {
            match session.stop() {
                Ok(_) => info!(camera = %identifier, "Replacing ended stream"),
                Err(e) => warn!(camera = %identifier, error = %e, "Replacing failed stream"),
            }
        }

        let settings = StreamSettings::from_config(&self.config, identifier);
        let started = StreamSession::start(&self.driver, &self.launcher, settings);

        let mut sessions = self.sessions();
        match started {
            Ok(session) => {
                sessions.insert(identifier.to_string(), Slot::Active(session));
                Ok(())
            }
            Err(e) => {
                sessions.remove(identifier);
                Err(e)
            }
        }
    }

    /// Stop streaming `identifier` and wait for the encoder to finish.
    ///
    /// Returns `Ok(None)` when no session was running. A session that died
    /// on a sink failure returns that failure here.
    pub fn stop(&self, identifier: &str) -> Result<Option<SessionReport>, CaptureError> {
        let session = {
            let mut sessions = self.sessions();
            match sessions.remove(identifier) {
                Some(Slot::Active(session)) => {
                    sessions.insert(identifier.to_string(), Slot::Stopping);
                    session
                }
                Some(pending) => {
                    sessions.insert(identifier.to_string(), pending);
                    warn!(camera = %identifier, "Stream is starting or stopping, stop ignored");
                    return Ok(None);
                }
                None => {
                    warn!(camera = %identifier, "No stream running, stop ignored");
                    return Ok(None);
                }
            }
        };

        let result = session.stop();
        self.sessions().remove(identifier);
        result.map(Some)
    }

    /// Stop every running session, returning each outcome.
    pub fn stop_all(&self) -> Vec<(String, Result<Option<SessionReport>, CaptureError>)> {
        let ids: Vec<String> = self.sessions().keys().cloned().collect();
        ids.into_iter()
            .map(|id| {
                let result = self.stop(&id);
                (id, result)
            })
            .collect()
    }

    /// Latest frame of `identifier`, or `None` outside a running session.
    pub fn get_frame(&self, identifier: &str) -> Option<Frame> {
        match self.sessions().get(identifier) {
            Some(Slot::Active(session)) => session.get_frame(),
            _ => None,
        }
    }

    /// Forget the preview frame of `identifier` without touching recording.
    pub fn clear_preview(&self, identifier: &str) {
        if let Some(Slot::Active(session)) = self.sessions().get(identifier) {
            session.clear_preview();
        }
    }

    pub fn state(&self, identifier: &str) -> SessionState {
        match self.sessions().get(identifier) {
            Some(Slot::Starting) => SessionState::Starting,
            Some(Slot::Active(session)) => session.state(),
            Some(Slot::Stopping) => SessionState::Stopping,
            None => SessionState::Idle,
        }
    }

    /// Sessions whose capture thread ended without a stop request.
    pub fn failed_sessions(&self) -> Vec<String> {
        self.sessions()
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Active(session) if session.state() == SessionState::Failed => {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions().len()
    }
}

impl<D: CameraDriver, L: SinkLauncher> Drop for StreamManager<D, L> {
    fn drop(&mut self) {
        for (id, result) in self.stop_all() {
            match result {
                Ok(Some(report)) => info!(camera = %id, frames = report.stats.frames_forwarded, "Stream stopped on shutdown"),
                Ok(None) => {}
                Err(e) => warn!(camera = %id, error = %e, "Stream failed during shutdown"),
            }
        }
    }
}
