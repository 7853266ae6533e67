//! The top-level supervision machine.
//!
//! Composes the [`SourceWatcher`] and successive [`ChildProcess`]
//! incarnations. After each event, eventless transitions are evaluated until
//! the machine settles.

use crate::bridge::{ExecutionId, ReadinessData};
use crate::error::{EXPORT_NOT_SERIALIZABLE, ModuleError};
use crate::log::Notice;

use super::Incarnation;
use super::child_process::{ChildEffect, ChildEvent, ChildProcess, ExitReport};
use super::source_watcher::{SourceWatcher, WatcherEffect, WatcherEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    Log,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillPhase {
    ChildProcess,
    FsWatcher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainState {
    Idle,
    Setup,
    Starting,
    Accessible,
    Restarting(RestartPhase),
    Failed,
    Killing(KillPhase),
    Killed,
}

impl MainState {
    fn is_killing_or_killed(self) -> bool {
        matches!(self, MainState::Killing(_) | MainState::Killed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MainEvent {
    Start,
    KillRequested,
    RestartRequested,
    ModuleChanged,
    /// A call was registered and buffered under `function_id`.
    Execute {
        execution_id: ExecutionId,
        function_id: String,
    },
    Watcher(WatcherEvent),
    ChildReady {
        incarnation: Incarnation,
        readiness: ReadinessData,
    },
    ChildExited {
        incarnation: Incarnation,
        exit: ExitReport,
    },
}

/// How a restart request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAck {
    /// A new incarnation is on its way; await the module.
    Respawning,
    /// The module is killed; nothing will restart.
    Ignored,
}

/// Work the supervisor performs on behalf of the machine, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartWatcher,
    CloseWatcher,
    SpawnChild(Incarnation),
    StopChild(Incarnation),
    ClearCallbacks,
    /// Deliver buffered groups that `readiness` can serve, reject the rest.
    ReleaseBuffered {
        incarnation: Incarnation,
        readiness: ReadinessData,
    },
    Drain {
        function_id: String,
        incarnation: Incarnation,
    },
    RejectExecution {
        execution_id: ExecutionId,
        error: ModuleError,
    },
    RejectBuffered(ModuleError),
    /// Reject calls still in flight on an exited incarnation.
    AbandonInFlight {
        incarnation: Incarnation,
        error: ModuleError,
    },
    RecreateModule,
    ResolveModule(ReadinessData),
    RejectModule(ModuleError),
    ResolveRestarts(RestartAck),
    RejectRestarts(ModuleError),
    ResolveKills,
    /// Release any residual watcher or worker handles.
    Teardown,
    Log(Notice),
}

/// Supervisor state plus its sub-machines.
#[derive(Debug, Clone)]
pub struct MainMachine {
    state: MainState,
    watcher: Option<SourceWatcher>,
    child: Option<ChildProcess>,
    incarnations: u64,
}

impl Default for MainMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl MainMachine {
    pub fn new() -> Self {
        Self {
            state: MainState::Idle,
            watcher: None,
            child: None,
            incarnations: 0,
        }
    }

    pub fn state(&self) -> MainState {
        self.state
    }

    pub fn child(&self) -> Option<&ChildProcess> {
        self.child.as_ref()
    }

    pub fn watcher(&self) -> Option<&SourceWatcher> {
        self.watcher.as_ref()
    }

    /// Readiness of the current incarnation, if reported.
    pub fn readiness(&self) -> Option<&ReadinessData> {
        self.child
            .as_ref()
            .and_then(|child| child.context().readiness.as_ref())
    }

    /// Process one event and settle.
    pub fn handle(&mut self, event: MainEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.dispatch(event, &mut effects);
        self.settle(&mut effects);
        effects
    }

    fn dispatch(&mut self, event: MainEvent, effects: &mut Vec<Effect>) {
        match event {
            MainEvent::Start => {
                if self.state == MainState::Idle {
                    self.enter_setup(effects);
                }
            }
            MainEvent::KillRequested => self.on_kill(effects),
            MainEvent::RestartRequested => self.on_restart(effects),
            MainEvent::ModuleChanged => match self.state {
                MainState::Starting => self.enter_restarting(RestartPhase::Wait, effects),
                MainState::Accessible | MainState::Failed => {
                    self.enter_restarting(RestartPhase::Log, effects)
                }
                _ => {}
            },
            MainEvent::Execute {
                execution_id,
                function_id,
            } => self.on_execute(execution_id, function_id, effects),
            MainEvent::Watcher(event) => {
                let Some(watcher) = self.watcher.as_mut() else {
                    return;
                };
                match watcher.handle(event) {
                    Some(WatcherEffect::NotifyChanged) => {
                        self.dispatch(MainEvent::ModuleChanged, effects)
                    }
                    Some(WatcherEffect::Close) => effects.push(Effect::CloseWatcher),
                    None => {}
                }
            }
            MainEvent::ChildReady {
                incarnation,
                readiness,
            } => {
                if let Some(child) = self.current_child_mut(incarnation) {
                    child.handle(ChildEvent::Ready(readiness));
                }
            }
            MainEvent::ChildExited { incarnation, exit } => {
                let error = if self.state.is_killing_or_killed() {
                    ModuleError::Killed
                } else {
                    ModuleError::Failure
                };
                effects.push(Effect::AbandonInFlight { incarnation, error });

                if let Some(child) = self.current_child_mut(incarnation) {
                    child.handle(ChildEvent::Exited(exit));
                }
            }
        }
    }

    fn on_kill(&mut self, effects: &mut Vec<Effect>) {
        match self.state {
            MainState::Idle => {
                effects.push(Effect::RejectModule(ModuleError::Unavailable));
                self.enter_killed(effects);
            }
            MainState::Setup | MainState::Starting | MainState::Restarting(_) => {
                effects.push(Effect::RejectModule(ModuleError::Unavailable));
                self.enter_killing(effects);
            }
            MainState::Accessible | MainState::Failed => self.enter_killing(effects),
            MainState::Killing(_) => {}
            MainState::Killed => effects.push(Effect::ResolveKills),
        }
    }

    fn on_restart(&mut self, effects: &mut Vec<Effect>) {
        match self.state {
            MainState::Idle | MainState::Setup => {
                effects.push(Effect::ResolveRestarts(RestartAck::Respawning))
            }
            MainState::Starting => self.enter_restarting(RestartPhase::Wait, effects),
            MainState::Accessible | MainState::Failed => {
                self.enter_restarting(RestartPhase::Log, effects)
            }
            // Settled when the current cycle concludes.
            MainState::Restarting(_) => {}
            MainState::Killing(_) | MainState::Killed => {
                effects.push(Effect::Log(Notice::CannotRestartKilled));
                effects.push(Effect::ResolveRestarts(RestartAck::Ignored));
            }
        }
    }

    fn on_execute(&mut self, execution_id: ExecutionId, function_id: String, effects: &mut Vec<Effect>) {
        match self.state {
            MainState::Accessible => {
                let (Some(child), Some(readiness)) = (self.child.as_ref(), self.readiness()) else {
                    return;
                };
                if readiness.is_callable(&function_id) {
                    effects.push(Effect::Drain {
                        function_id,
                        incarnation: child.incarnation(),
                    });
                    return;
                }

                let message = if readiness.exports_functions() {
                    format!("Module does not export a function named \"{function_id}\"")
                } else {
                    format!("Cannot execute module of {} type", readiness.kind())
                };
                effects.push(Effect::RejectExecution {
                    execution_id,
                    error: ModuleError::InvalidModuleType(message),
                });
            }
            MainState::Killing(_) | MainState::Killed => effects.push(Effect::RejectExecution {
                execution_id,
                error: ModuleError::Killed,
            }),
            // Stays buffered until a worker can take it.
            _ => {}
        }
    }

    /// Evaluate eventless transitions until none applies.
    fn settle(&mut self, effects: &mut Vec<Effect>) {
        loop {
            let moved = match self.state {
                MainState::Setup if self.watcher.as_ref().is_some_and(SourceWatcher::is_ready) => {
                    self.enter_starting(effects);
                    true
                }
                MainState::Starting => match self.child.as_ref() {
                    Some(child) if child.is_stopped() => {
                        self.enter_failed(effects);
                        true
                    }
                    Some(child)
                        if child.context().readiness.is_some() && !child.stop_requested() =>
                    {
                        self.enter_accessible(effects);
                        true
                    }
                    _ => false,
                },
                MainState::Accessible if self.child.as_ref().is_some_and(ChildProcess::is_stopped) => {
                    self.enter_failed(effects);
                    true
                }
                MainState::Restarting(RestartPhase::Log) => {
                    self.state = MainState::Restarting(RestartPhase::Wait);
                    true
                }
                MainState::Restarting(RestartPhase::Wait) => self.settle_restart(effects),
                MainState::Killing(KillPhase::ChildProcess) => {
                    self.enter_killing_watcher(effects);
                    true
                }
                MainState::Killing(KillPhase::FsWatcher) => {
                    let watcher_done = self.watcher.as_ref().is_none_or(SourceWatcher::is_stopped);
                    let child_done = self.child.as_ref().is_none_or(ChildProcess::is_stopped);
                    if watcher_done && child_done {
                        self.enter_killed(effects);
                    }
                    watcher_done && child_done
                }
                _ => false,
            };
            if !moved {
                break;
            }
        }
    }

    fn settle_restart(&mut self, effects: &mut Vec<Effect>) -> bool {
        let Some(child) = self.child.as_ref() else {
            effects.push(Effect::ResolveRestarts(RestartAck::Respawning));
            self.enter_starting(effects);
            return true;
        };
        if !child.is_stopped() {
            return false;
        }

        let context = child.context();
        if child.stop_requested() && context.readiness.is_some() && !context.exited_cleanly {
            effects.push(Effect::RejectRestarts(self.failure_error()));
            self.enter_failed(effects);
        } else {
            effects.push(Effect::ResolveRestarts(RestartAck::Respawning));
            self.enter_starting(effects);
        }
        true
    }

    fn enter_setup(&mut self, effects: &mut Vec<Effect>) {
        self.state = MainState::Setup;
        self.watcher = Some(SourceWatcher::new());
        effects.push(Effect::StartWatcher);
    }

    fn enter_starting(&mut self, effects: &mut Vec<Effect>) {
        self.state = MainState::Starting;
        self.incarnations += 1;
        let incarnation = Incarnation(self.incarnations);
        self.child = Some(ChildProcess::new(incarnation));
        effects.push(Effect::SpawnChild(incarnation));
    }

    fn enter_accessible(&mut self, effects: &mut Vec<Effect>) {
        self.state = MainState::Accessible;
        let (Some(child), Some(readiness)) = (self.child.as_ref(), self.readiness()) else {
            return;
        };
        let readiness = readiness.clone();

        effects.push(Effect::ClearCallbacks);
        effects.push(Effect::ReleaseBuffered {
            incarnation: child.incarnation(),
            readiness: readiness.clone(),
        });

        if !readiness.exports_functions() && !readiness.serializable {
            effects.push(Effect::Log(Notice::SerializationFailed));
            effects.push(Effect::RejectModule(ModuleError::Serialization(
                EXPORT_NOT_SERIALIZABLE.to_string(),
            )));
            return;
        }
        effects.push(Effect::ResolveModule(readiness));
        effects.push(Effect::Log(Notice::Ready));
    }

    fn enter_restarting(&mut self, phase: RestartPhase, effects: &mut Vec<Effect>) {
        self.state = MainState::Restarting(phase);
        self.stop_child(effects);
        effects.push(Effect::RecreateModule);
        if phase == RestartPhase::Log {
            effects.push(Effect::Log(Notice::Restarting));
        }
    }

    fn enter_failed(&mut self, effects: &mut Vec<Effect>) {
        self.state = MainState::Failed;
        let notice = if self.transpiler_error() {
            Notice::TranspilerMissing
        } else {
            Notice::Failed
        };
        effects.push(Effect::Log(notice));
        effects.push(Effect::RejectModule(self.failure_error()));
    }

    fn enter_killing(&mut self, effects: &mut Vec<Effect>) {
        self.state = MainState::Killing(KillPhase::ChildProcess);
        effects.push(Effect::RejectBuffered(ModuleError::Killed));
        self.stop_child(effects);
    }

    fn enter_killing_watcher(&mut self, effects: &mut Vec<Effect>) {
        self.state = MainState::Killing(KillPhase::FsWatcher);
        if let Some(watcher) = self.watcher.as_mut()
            && let Some(WatcherEffect::Close) = watcher.handle(WatcherEvent::StopRequested)
        {
            effects.push(Effect::CloseWatcher);
        }
    }

    fn enter_killed(&mut self, effects: &mut Vec<Effect>) {
        self.state = MainState::Killed;
        effects.push(Effect::ResolveKills);
        effects.push(Effect::Teardown);
    }

    fn stop_child(&mut self, effects: &mut Vec<Effect>) {
        if let Some(child) = self.child.as_mut()
            && let Some(ChildEffect::Terminate) = child.handle(ChildEvent::StopRequested)
        {
            effects.push(Effect::StopChild(child.incarnation()));
        }
    }

    fn current_child_mut(&mut self, incarnation: Incarnation) -> Option<&mut ChildProcess> {
        self.child
            .as_mut()
            .filter(|child| child.incarnation() == incarnation)
    }

    fn transpiler_error(&self) -> bool {
        self.child
            .as_ref()
            .is_some_and(|child| child.context().transpiler_error)
    }

    fn failure_error(&self) -> ModuleError {
        if self.transpiler_error() {
            ModuleError::TranspilerMissing
        } else {
            ModuleError::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{DEFAULT_FUNCTION_ID, FUNCTION_MARKER};
    use serde_json::json;

    fn function_readiness() -> ReadinessData {
        ReadinessData {
            body: Some(json!(FUNCTION_MARKER)),
            serializable: true,
            exported_function_ids: [DEFAULT_FUNCTION_ID.to_string()].into(),
        }
    }

    fn value_readiness(value: serde_json::Value) -> ReadinessData {
        ReadinessData {
            body: Some(value),
            serializable: true,
            exported_function_ids: Default::default(),
        }
    }

    /// Drive a machine up to `accessible` on incarnation 1.
    fn accessible(readiness: ReadinessData) -> MainMachine {
        let mut machine = MainMachine::new();
        assert_eq!(machine.handle(MainEvent::Start), vec![Effect::StartWatcher]);
        assert_eq!(
            machine.handle(MainEvent::Watcher(WatcherEvent::Ready)),
            vec![Effect::SpawnChild(Incarnation(1))]
        );
        machine.handle(MainEvent::ChildReady {
            incarnation: Incarnation(1),
            readiness,
        });
        assert_eq!(machine.state(), MainState::Accessible);
        machine
    }

    fn exited(incarnation: u64, code: Option<i32>) -> MainEvent {
        MainEvent::ChildExited {
            incarnation: Incarnation(incarnation),
            exit: ExitReport { code },
        }
    }

    #[test]
    fn test_first_readiness_resolves_module() {
        let mut machine = MainMachine::new();
        machine.handle(MainEvent::Start);
        machine.handle(MainEvent::Watcher(WatcherEvent::Ready));
        let effects = machine.handle(MainEvent::ChildReady {
            incarnation: Incarnation(1),
            readiness: value_readiness(json!(1)),
        });

        assert_eq!(
            effects,
            vec![
                Effect::ClearCallbacks,
                Effect::ReleaseBuffered {
                    incarnation: Incarnation(1),
                    readiness: value_readiness(json!(1)),
                },
                Effect::ResolveModule(value_readiness(json!(1))),
                Effect::Log(Notice::Ready),
            ]
        );
    }

    #[test]
    fn test_execute_while_accessible() {
        let mut machine = accessible(function_readiness());
        let execution_id = ExecutionId::new();
        assert_eq!(
            machine.handle(MainEvent::Execute {
                execution_id,
                function_id: DEFAULT_FUNCTION_ID.to_string(),
            }),
            vec![Effect::Drain {
                function_id: DEFAULT_FUNCTION_ID.to_string(),
                incarnation: Incarnation(1),
            }]
        );

        let mut machine = accessible(value_readiness(json!(1)));
        assert_eq!(
            machine.handle(MainEvent::Execute {
                execution_id,
                function_id: DEFAULT_FUNCTION_ID.to_string(),
            }),
            vec![Effect::RejectExecution {
                execution_id,
                error: ModuleError::InvalidModuleType("Cannot execute module of number type".to_string()),
            }]
        );
    }

    #[test]
    fn test_execute_buffers_while_starting() {
        let mut machine = MainMachine::new();
        machine.handle(MainEvent::Start);
        let effects = machine.handle(MainEvent::Execute {
            execution_id: ExecutionId::new(),
            function_id: DEFAULT_FUNCTION_ID.to_string(),
        });
        assert!(effects.is_empty());
    }

    #[test]
    fn test_restart_cycle() {
        let mut machine = accessible(function_readiness());

        let effects = machine.handle(MainEvent::ModuleChanged);
        assert_eq!(
            effects,
            vec![
                Effect::StopChild(Incarnation(1)),
                Effect::RecreateModule,
                Effect::Log(Notice::Restarting),
            ]
        );
        assert_eq!(machine.state(), MainState::Restarting(RestartPhase::Wait));

        let effects = machine.handle(exited(1, None));
        assert_eq!(
            effects,
            vec![
                Effect::AbandonInFlight {
                    incarnation: Incarnation(1),
                    error: ModuleError::Failure,
                },
                Effect::ResolveRestarts(RestartAck::Respawning),
                Effect::SpawnChild(Incarnation(2)),
            ]
        );
        assert_eq!(machine.state(), MainState::Starting);
    }

    #[test]
    fn test_unclean_stop_during_restart_fails() {
        let mut machine = accessible(function_readiness());
        machine.handle(MainEvent::RestartRequested);
        let effects = machine.handle(exited(1, Some(1)));

        assert!(effects.contains(&Effect::RejectRestarts(ModuleError::Failure)));
        assert!(effects.contains(&Effect::RejectModule(ModuleError::Failure)));
        assert_eq!(machine.state(), MainState::Failed);
    }

    #[test]
    fn test_restart_after_crash_respawns() {
        let mut machine = accessible(function_readiness());
        machine.handle(exited(1, Some(1)));
        assert_eq!(machine.state(), MainState::Failed);

        let effects = machine.handle(MainEvent::RestartRequested);
        assert_eq!(
            effects,
            vec![
                Effect::RecreateModule,
                Effect::Log(Notice::Restarting),
                Effect::ResolveRestarts(RestartAck::Respawning),
                Effect::SpawnChild(Incarnation(2)),
            ]
        );
    }

    #[test]
    fn test_exit_before_readiness_fails_even_when_clean() {
        let mut machine = MainMachine::new();
        machine.handle(MainEvent::Start);
        machine.handle(MainEvent::Watcher(WatcherEvent::Ready));
        let effects = machine.handle(exited(1, Some(0)));

        assert_eq!(machine.state(), MainState::Failed);
        assert!(effects.contains(&Effect::RejectModule(ModuleError::Failure)));
    }

    #[test]
    fn test_transpiler_missing() {
        let mut machine = MainMachine::new();
        machine.handle(MainEvent::Start);
        machine.handle(MainEvent::Watcher(WatcherEvent::Ready));
        let effects = machine.handle(exited(1, Some(2)));

        assert!(effects.contains(&Effect::Log(Notice::TranspilerMissing)));
        assert!(effects.contains(&Effect::RejectModule(ModuleError::TranspilerMissing)));
    }

    #[test]
    fn test_late_readiness_after_restart_request_is_not_accessible() {
        let mut machine = MainMachine::new();
        machine.handle(MainEvent::Start);
        machine.handle(MainEvent::Watcher(WatcherEvent::Ready));
        machine.handle(MainEvent::RestartRequested);

        let effects = machine.handle(MainEvent::ChildReady {
            incarnation: Incarnation(1),
            readiness: function_readiness(),
        });
        assert!(effects.is_empty());
        assert_eq!(machine.state(), MainState::Restarting(RestartPhase::Wait));

        machine.handle(exited(1, None));
        assert_eq!(machine.state(), MainState::Starting);
        assert_eq!(machine.child().map(ChildProcess::incarnation), Some(Incarnation(2)));
    }

    #[test]
    fn test_stale_readiness_is_ignored() {
        let mut machine = accessible(function_readiness());
        machine.handle(MainEvent::RestartRequested);
        machine.handle(exited(1, None));

        let effects = machine.handle(MainEvent::ChildReady {
            incarnation: Incarnation(1),
            readiness: value_readiness(json!(1)),
        });
        assert!(effects.is_empty());
        assert_eq!(machine.state(), MainState::Starting);
    }

    #[test]
    fn test_kill_from_accessible() {
        let mut machine = accessible(function_readiness());
        let effects = machine.handle(MainEvent::KillRequested);
        assert_eq!(
            effects,
            vec![
                Effect::RejectBuffered(ModuleError::Killed),
                Effect::StopChild(Incarnation(1)),
                Effect::CloseWatcher,
            ]
        );
        assert_eq!(machine.state(), MainState::Killing(KillPhase::FsWatcher));

        assert!(machine.handle(MainEvent::Watcher(WatcherEvent::Stopped)).is_empty());
        let effects = machine.handle(exited(1, None));
        assert_eq!(
            effects,
            vec![
                Effect::AbandonInFlight {
                    incarnation: Incarnation(1),
                    error: ModuleError::Killed,
                },
                Effect::ResolveKills,
                Effect::Teardown,
            ]
        );

        assert_eq!(machine.handle(MainEvent::KillRequested), vec![Effect::ResolveKills]);
        assert_eq!(
            machine.handle(MainEvent::RestartRequested),
            vec![
                Effect::Log(Notice::CannotRestartKilled),
                Effect::ResolveRestarts(RestartAck::Ignored),
            ]
        );
    }

    #[test]
    fn test_kill_from_idle_and_setup() {
        let mut machine = MainMachine::new();
        assert_eq!(
            machine.handle(MainEvent::KillRequested),
            vec![
                Effect::RejectModule(ModuleError::Unavailable),
                Effect::ResolveKills,
                Effect::Teardown,
            ]
        );
        assert_eq!(machine.state(), MainState::Killed);

        let mut machine = MainMachine::new();
        machine.handle(MainEvent::Start);
        let effects = machine.handle(MainEvent::KillRequested);
        assert_eq!(
            effects,
            vec![
                Effect::RejectModule(ModuleError::Unavailable),
                Effect::RejectBuffered(ModuleError::Killed),
                Effect::CloseWatcher,
            ]
        );
        machine.handle(MainEvent::Watcher(WatcherEvent::Stopped));
        assert_eq!(machine.state(), MainState::Killed);
    }

    #[test]
    fn test_execute_after_kill_is_rejected() {
        let mut machine = MainMachine::new();
        machine.handle(MainEvent::KillRequested);
        let execution_id = ExecutionId::new();
        assert_eq!(
            machine.handle(MainEvent::Execute {
                execution_id,
                function_id: DEFAULT_FUNCTION_ID.to_string(),
            }),
            vec![Effect::RejectExecution {
                execution_id,
                error: ModuleError::Killed,
            }]
        );
    }

    #[test]
    fn test_non_serializable_value_rejects_module() {
        let mut machine = MainMachine::new();
        machine.handle(MainEvent::Start);
        machine.handle(MainEvent::Watcher(WatcherEvent::Ready));
        let effects = machine.handle(MainEvent::ChildReady {
            incarnation: Incarnation(1),
            readiness: ReadinessData {
                body: None,
                serializable: false,
                exported_function_ids: Default::default(),
            },
        });
        assert!(effects.contains(&Effect::RejectModule(ModuleError::Serialization(
            EXPORT_NOT_SERIALIZABLE.to_string()
        ))));
        assert_eq!(machine.state(), MainState::Accessible);
    }

    #[test]
    fn test_changes_while_restarting_do_not_stack() {
        let mut machine = accessible(function_readiness());
        machine.handle(MainEvent::ModuleChanged);
        assert!(machine.handle(MainEvent::ModuleChanged).is_empty());
        assert!(machine.handle(MainEvent::RestartRequested).is_empty());
    }
}
