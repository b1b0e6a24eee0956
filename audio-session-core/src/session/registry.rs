use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::device::DeviceDescriptor;
use crate::models::error::AudioError;
use crate::session::audio_session::{AudioSession, ReleaseReport};
use crate::traits::backend::AudioBackend;

/// Opaque handle for a session tracked by a [`SessionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Outcome of tearing down every tracked session.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub released: usize,
    /// Sessions whose release reported step failures, with those failures.
    pub failed: Vec<(SessionId, Vec<(&'static str, AudioError)>)>,
    /// Sessions whose release panicked.
    pub panicked: Vec<SessionId>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.panicked.is_empty()
    }
}

/// Owns every open session and tears them down together.
///
/// Sessions are handed out as `Arc`s so a pump thread can hold one, but the
/// registry decides when the underlying handles go away: `release` and
/// `drain` release the session even if callers still hold a reference, after
/// which those references only report `SessionClosed`.
pub struct SessionRegistry {
    backend: Arc<dyn AudioBackend>,
    sessions: Mutex<Vec<(SessionId, Arc<AudioSession>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// Open a session on `device` and start tracking it.
    pub fn open(&self, device: &DeviceDescriptor) -> Result<(SessionId, Arc<AudioSession>), AudioError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudioError::SessionClosed);
        }

        let session = Arc::new(AudioSession::open(self.backend.as_ref(), device)?);
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().push((id, Arc::clone(&session)));

        log::debug!("{}: tracking {} on {}", id, session.guid(), device.id);
        Ok((id, session))
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<AudioSession>> {
        self.sessions
            .lock()
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, s)| Arc::clone(s))
    }

    /// Release one session and stop tracking it.
    ///
    /// Releasing an unknown or already released id is a no-op.
    pub fn release(&self, id: SessionId) -> ReleaseReport {
        let removed = {
            let mut sessions = self.sessions.lock();
            sessions
                .iter()
                .position(|(sid, _)| *sid == id)
                .map(|pos| sessions.remove(pos))
        };

        match removed {
            Some((_, session)) => session.release(),
            None => ReleaseReport {
                already_released: true,
                failures: Vec::new(),
            },
        }
    }

    /// Ids of tracked sessions in creation order.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Release every tracked session, newest first.
    ///
    /// A session that fails or panics while releasing is logged and skipped;
    /// the rest are still released.
    pub fn drain(&self) -> DrainReport {
        let sessions = std::mem::take(&mut *self.sessions.lock());
        let mut report = DrainReport::default();

        for (id, session) in sessions.into_iter().rev() {
            match panic::catch_unwind(AssertUnwindSafe(|| session.release())) {
                Ok(release) if release.is_clean() => report.released += 1,
                Ok(release) => {
                    for (step, e) in &release.failures {
                        log::error!("{}: releasing {} failed during teardown: {}", id, step, e);
                    }
                    report.released += 1;
                    report.failed.push((id, release.failures));
                }
                Err(_) => {
                    log::error!("{}: release panicked during teardown", id);
                    report.panicked.push(id);
                }
            }
        }

        if report.released > 0 {
            log::debug!("released {} sessions", report.released);
        }
        report
    }

    /// Drain and refuse further `open` calls.
    pub fn shutdown(&self) -> DrainReport {
        self.closed.store(true, Ordering::SeqCst);
        self.drain()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("backend", &self.backend.name())
            .field("sessions", &self.ids())
            .finish()
    }
}
