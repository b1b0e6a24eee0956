//! Manual-reset wait primitive between a device's completion path and a pump thread.
//!
//! The primitive is split in two halves: [`ReadySignal`] is held by the session
//! and only waits or resets, while [`DeviceNotifier`] is handed to the backend
//! when the session registers for events and is the only way to signal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Result of blocking on a [`ReadySignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    /// The device handle behind the signal was invalidated.
    Abandoned,
}

#[derive(Debug, Default)]
struct SignalState {
    signaled: bool,
    abandoned: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SignalState>,
    cond: Condvar,
}

/// Waiting half of the primitive.
#[derive(Debug, Default)]
pub struct ReadySignal {
    shared: Arc<Shared>,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the signalling half for a backend.
    pub(crate) fn notifier(&self) -> DeviceNotifier {
        DeviceNotifier {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block until signaled, abandoned, or `timeout` elapses.
    ///
    /// Only the calling thread blocks. The signaled state is left set; call
    /// [`reset`](Self::reset) to clear it.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.abandoned {
                return WaitOutcome::Abandoned;
            }
            if state.signaled {
                return WaitOutcome::Signaled;
            }
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return if state.abandoned {
                    WaitOutcome::Abandoned
                } else if state.signaled {
                    WaitOutcome::Signaled
                } else {
                    WaitOutcome::TimedOut
                };
            }
        }
    }

    /// Clear the signaled state. An abandoned signal stays abandoned.
    pub fn reset(&self) {
        self.shared.state.lock().signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.shared.state.lock().signaled
    }

    pub fn is_abandoned(&self) -> bool {
        self.shared.state.lock().abandoned
    }

    /// Tear the primitive down: outstanding and future waits observe `Abandoned`.
    pub(crate) fn close(&self) {
        let mut state = self.shared.state.lock();
        state.abandoned = true;
        state.signaled = false;
        self.shared.cond.notify_all();
    }

    /// Number of live notifier halves.
    pub fn notifier_count(&self) -> usize {
        Arc::strong_count(&self.shared) - 1
    }
}

/// Signalling half, owned by the device completion path.
#[derive(Debug, Clone)]
pub struct DeviceNotifier {
    shared: Arc<Shared>,
}

impl DeviceNotifier {
    /// Frames (capture) or space (render) became available.
    pub fn signal(&self) {
        let mut state = self.shared.state.lock();
        if state.abandoned {
            return;
        }
        state.signaled = true;
        self.shared.cond.notify_all();
    }

    /// The device handle was invalidated.
    pub fn abandon(&self) {
        let mut state = self.shared.state.lock();
        state.abandoned = true;
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn times_out_without_signal() {
        let signal = ReadySignal::new();
        let start = Instant::now();
        assert_eq!(signal.wait(Duration::from_millis(30)), WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn signal_wakes_waiter_on_other_thread() {
        let signal = ReadySignal::new();
        let notifier = signal.notifier();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            notifier.signal();
        });

        assert_eq!(signal.wait(Duration::from_secs(5)), WaitOutcome::Signaled);
        handle.join().unwrap();
    }

    #[test]
    fn manual_reset_keeps_state_until_reset() {
        let signal = ReadySignal::new();
        signal.notifier().signal();

        assert_eq!(signal.wait(Duration::ZERO), WaitOutcome::Signaled);
        assert_eq!(signal.wait(Duration::ZERO), WaitOutcome::Signaled);

        signal.reset();
        assert!(!signal.is_signaled());
        assert_eq!(signal.wait(Duration::from_millis(1)), WaitOutcome::TimedOut);
    }

    #[test]
    fn abandon_wins_over_signal() {
        let signal = ReadySignal::new();
        let notifier = signal.notifier();
        notifier.signal();
        notifier.abandon();

        assert_eq!(signal.wait(Duration::from_millis(1)), WaitOutcome::Abandoned);
        signal.reset();
        assert_eq!(signal.wait(Duration::from_millis(1)), WaitOutcome::Abandoned);
    }

    #[test]
    fn close_ignores_late_signals() {
        let signal = ReadySignal::new();
        let notifier = signal.notifier();
        assert_eq!(signal.notifier_count(), 1);

        signal.close();
        notifier.signal();

        assert!(!signal.is_signaled());
        assert_eq!(signal.wait(Duration::ZERO), WaitOutcome::Abandoned);

        drop(notifier);
        assert_eq!(signal.notifier_count(), 0);
    }
}
