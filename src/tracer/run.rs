use crate::tracer::address::TargetAddress;
use crate::tracer::error::Error;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use strum_macros::FromRepr;

/// Tracing run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum RunState {
    /// No active run.
    Idle,
    /// Tracing in progress, hits are dispatched.
    Active,
    /// Stop requested, teardown in progress. New hits are not dispatched;
    /// in-flight hits observe this state and wind down.
    Stopping,
}

/// Why the run left `Active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A tracepoint reached its pass count.
    PassCount { number: u32, address: TargetAddress },
    /// Explicit stop request from the controlling debugger.
    External,
}

/// Run status reported back to the controlling debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// No run has been started yet.
    NeverRun,
    Running,
    Stopped(StopReason),
}

/// Process-wide tracing-run state.
///
/// The state lives in an atomic: the stop transition must be visible to
/// hit dispatch and stepping loops running on arbitrary target threads.
pub(super) struct RunController {
    state: AtomicU8,
    last_stop: Mutex<Option<StopReason>>,
}

impl RunController {
    pub(super) fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Idle as u8),
            last_stop: Mutex::new(None),
        }
    }

    pub(super) fn state(&self) -> RunState {
        RunState::from_repr(self.state.load(Ordering::SeqCst)).expect("invalid run state value")
    }

    pub(super) fn is_active(&self) -> bool {
        self.state() == RunState::Active
    }

    pub(super) fn is_stopping(&self) -> bool {
        self.state() == RunState::Stopping
    }

    /// Begin a run. Entry state is not reset: entries persist across
    /// starts unless explicitly cleared.
    pub(super) fn start(&self) -> Result<(), Error> {
        self.state
            .compare_exchange(
                RunState::Idle as u8,
                RunState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| Error::AlreadyActive)?;
        *self.last_stop.lock().expect("stop reason lock poisoned") = None;
        Ok(())
    }

    /// Roll back a `start` whose installation phase failed.
    pub(super) fn abort_start(&self) {
        let _ = self.state.compare_exchange(
            RunState::Active as u8,
            RunState::Idle as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Explicit external stop request.
    pub(super) fn request_stop(&self) -> Result<(), Error> {
        match self.transition_to_stopping(StopReason::External) {
            true => Ok(()),
            // a stop racing another stop is not an error
            false if self.is_stopping() => Ok(()),
            false => Err(Error::NotActive),
        }
    }

    /// Called by the hit dispatcher when an entry exhausts its pass count.
    /// Returns true for the call that actually performed the
    /// `Active -> Stopping` transition.
    pub(super) fn notify_pass_exhausted(&self, number: u32, address: TargetAddress) -> bool {
        self.transition_to_stopping(StopReason::PassCount { number, address })
    }

    fn transition_to_stopping(&self, reason: StopReason) -> bool {
        let won = self
            .state
            .compare_exchange(
                RunState::Active as u8,
                RunState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            *self.last_stop.lock().expect("stop reason lock poisoned") = Some(reason);
        }
        won
    }

    /// Complete teardown. Hit counts and source strings of registry
    /// entries survive for later reporting.
    pub(super) fn finish_teardown(&self) {
        let prev = self.state.swap(RunState::Idle as u8, Ordering::SeqCst);
        debug_assert_eq!(prev, RunState::Stopping as u8);
    }

    pub(super) fn stop_reason(&self) -> Option<StopReason> {
        self.last_stop
            .lock()
            .expect("stop reason lock poisoned")
            .clone()
    }

    pub(super) fn status(&self) -> RunStatus {
        match self.state() {
            RunState::Active => RunStatus::Running,
            RunState::Idle | RunState::Stopping => match self.stop_reason() {
                Some(reason) => RunStatus::Stopped(reason),
                None => RunStatus::NeverRun,
            },
        }
    }
}
