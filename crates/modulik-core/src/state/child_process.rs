//! Lifecycle of one worker incarnation.

use std::process::ExitStatus;

use crate::bridge::ReadinessData;

use super::Incarnation;

/// Exit code a worker uses when its transpiler cannot be loaded.
pub const TRANSPILER_MISSING_EXIT_CODE: i32 = 2;

/// Exit code reported when the worker entry could not be spawned at all.
const SPAWN_FAILED_EXIT_CODE: i32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildProcessState {
    Starting,
    Ready,
    Stopping,
    Stopped,
}

/// What is known about an incarnation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildProcessContext {
    pub exited_cleanly: bool,
    pub transpiler_error: bool,
    pub readiness: Option<ReadinessData>,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, or `None` when terminated by a signal.
    pub code: Option<i32>,
}

impl ExitReport {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }

    pub fn spawn_failed() -> Self {
        Self {
            code: Some(SPAWN_FAILED_EXIT_CODE),
        }
    }

    pub fn is_transpiler_missing(&self) -> bool {
        self.code == Some(TRANSPILER_MISSING_EXIT_CODE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Ready(ReadinessData),
    StopRequested,
    Exited(ExitReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEffect {
    /// Ask the worker process to terminate.
    Terminate,
}

/// Machine for one incarnation: `starting -> ready -> stopping -> stopped`.
///
/// Spawning is implied by creating the machine.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    incarnation: Incarnation,
    state: ChildProcessState,
    context: ChildProcessContext,
    stop_requested: bool,
}

impl ChildProcess {
    pub fn new(incarnation: Incarnation) -> Self {
        Self {
            incarnation,
            state: ChildProcessState::Starting,
            context: ChildProcessContext::default(),
            stop_requested: false,
        }
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn state(&self) -> ChildProcessState {
        self.state
    }

    pub fn context(&self) -> &ChildProcessContext {
        &self.context
    }

    /// Whether a stop was requested for this incarnation.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ChildProcessState::Stopped
    }

    /// Whether the incarnation is still running and has not been asked to stop.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state,
            ChildProcessState::Starting | ChildProcessState::Ready
        )
    }

    pub fn handle(&mut self, event: ChildEvent) -> Option<ChildEffect> {
        match (self.state, event) {
            (ChildProcessState::Starting, ChildEvent::Ready(readiness)) => {
                self.context.readiness = Some(readiness);
                self.state = ChildProcessState::Ready;
                None
            }
            // A stop was already requested: keep the data, not the transition.
            (ChildProcessState::Stopping, ChildEvent::Ready(readiness)) => {
                self.context.readiness.get_or_insert(readiness);
                None
            }
            (ChildProcessState::Starting | ChildProcessState::Ready, ChildEvent::StopRequested) => {
                self.stop_requested = true;
                self.state = ChildProcessState::Stopping;
                Some(ChildEffect::Terminate)
            }
            (ChildProcessState::Stopped, _) => None,
            (state, ChildEvent::Exited(exit)) => {
                let clean = match state {
                    ChildProcessState::Stopping => exit.code.is_none_or(|code| code == 0),
                    _ => exit.code == Some(0),
                };
                self.context.exited_cleanly = clean;
                self.context.transpiler_error = exit.is_transpiler_missing();
                self.state = ChildProcessState::Stopped;
                None
            }
            _ => None,
        }
    }
}
