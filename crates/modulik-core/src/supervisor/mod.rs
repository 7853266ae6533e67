//! The supervisor actor.
//!
//! One task per module processes every event sequentially: caller commands,
//! watcher notifications, worker messages and worker exits. Events go through
//! the [`MainMachine`], and the actor performs the effects it returns.

mod process;
mod watcher;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::bridge::args::marshal;
use crate::bridge::{Arg, CallbackId, ExecutionId, ExecutionOutcome, HostMessage, WorkerMessage};
use crate::callbacks::HostCallbacks;
use crate::config::Config;
use crate::error::{ModuleError, NOT_A_FUNCTION, RESULT_NOT_SERIALIZABLE};
use crate::handle::{LifecycleEvent, ModuleSlot};
use crate::log::{Logger, Notice};
use crate::registry::{ExecutionRegistry, Reply};
use crate::state::{
    Effect, ExitReport, Incarnation, MainEvent, MainMachine, MainState, RestartAck, WatcherEvent,
};

use process::WorkerProcess;
use watcher::SourceWatch;

/// Everything the actor reacts to.
#[derive(Debug)]
pub(crate) enum Event {
    Start,
    Execute {
        function_id: String,
        args: Vec<Arg>,
        reply: Reply,
    },
    Restart {
        reply: oneshot::Sender<Result<RestartAck, ModuleError>>,
    },
    Kill {
        reply: oneshot::Sender<()>,
    },
    /// The caller's handle is gone.
    HandleDropped,
    Watcher(WatcherEvent),
    Worker {
        incarnation: Incarnation,
        message: WorkerMessage,
    },
    WorkerExited {
        incarnation: Incarnation,
        exit: ExitReport,
    },
}

/// State owned by the actor task.
pub(crate) struct Supervisor {
    config: Config,
    logger: Logger,
    machine: MainMachine,
    events: mpsc::UnboundedSender<Event>,
    registry: ExecutionRegistry,
    callbacks: HostCallbacks,
    worker: Option<WorkerProcess>,
    watch: Option<SourceWatch>,
    slot: ModuleSlot,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    restart_waiters: Vec<oneshot::Sender<Result<RestartAck, ModuleError>>>,
    kill_waiters: Vec<oneshot::Sender<()>>,
    handle_dropped: bool,
}

impl Supervisor {
    pub(crate) fn new(
        config: Config,
        events: mpsc::UnboundedSender<Event>,
        slot: ModuleSlot,
        lifecycle: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            logger: Logger::new(&config),
            config,
            machine: MainMachine::new(),
            events,
            registry: ExecutionRegistry::default(),
            callbacks: HostCallbacks::default(),
            worker: None,
            watch: None,
            slot,
            lifecycle,
            restart_waiters: Vec::new(),
            kill_waiters: Vec::new(),
            handle_dropped: false,
        }
    }

    /// Process events until the module is killed and its handle dropped.
    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            self.on_event(event);
            if self.handle_dropped && self.machine.state() == MainState::Killed {
                break;
            }
        }
        tracing::debug!(module = %self.config.path.display(), "Supervisor stopped");
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Start => self.feed(MainEvent::Start),
            Event::Execute {
                function_id,
                args,
                reply,
            } => {
                let execution_id = self.registry.register(&function_id, args, reply);
                self.feed(MainEvent::Execute {
                    execution_id,
                    function_id,
                });
            }
            Event::Restart { reply } => {
                self.restart_waiters.push(reply);
                self.feed(MainEvent::RestartRequested);
            }
            Event::Kill { reply } => {
                self.kill_waiters.push(reply);
                self.feed(MainEvent::KillRequested);
            }
            Event::HandleDropped => {
                self.handle_dropped = true;
                if !matches!(self.machine.state(), MainState::Killing(_) | MainState::Killed) {
                    self.feed(MainEvent::KillRequested);
                }
            }
            Event::Watcher(event) => self.feed(MainEvent::Watcher(event)),
            Event::Worker {
                incarnation,
                message,
            } => self.on_worker_message(incarnation, message),
            Event::WorkerExited { incarnation, exit } => {
                if self
                    .worker
                    .as_ref()
                    .is_some_and(|worker| worker.incarnation() == incarnation)
                {
                    self.worker = None;
                }
                self.feed(MainEvent::ChildExited { incarnation, exit });
            }
        }
    }

    fn on_worker_message(&mut self, incarnation: Incarnation, message: WorkerMessage) {
        match message {
            WorkerMessage::Ready(readiness) => self.feed(MainEvent::ChildReady {
                incarnation,
                readiness,
            }),
            WorkerMessage::ExecutionResult {
                execution_id,
                result,
            } => {
                let result = result.into_result(RESULT_NOT_SERIALIZABLE);
                if !self.registry.resolve(execution_id, incarnation, result) {
                    tracing::debug!(%execution_id, %incarnation, "Ignoring result of unknown execution");
                }
            }
            WorkerMessage::ExecuteCallback {
                callback_id,
                execution_id,
                args,
            } => self.run_callback(incarnation, callback_id, execution_id, args),
        }
    }

    /// Run a host callback on its own task and answer the worker that asked.
    fn run_callback(
        &mut self,
        incarnation: Incarnation,
        callback_id: CallbackId,
        execution_id: ExecutionId,
        args: Vec<Value>,
    ) {
        let Some(worker) = self
            .worker
            .as_ref()
            .filter(|worker| worker.incarnation() == incarnation)
        else {
            return;
        };
        let outbox = worker.outbox();
        let callback = self.callbacks.get(callback_id);

        tokio::spawn(async move {
            let result = match callback {
                Some(callback) => callback.invoke(args).await,
                None => ExecutionOutcome::failure("Callback is no longer available"),
            };
            let _ = outbox.send(HostMessage::CallbackExecutionResult {
                execution_id,
                result,
            });
        });
    }

    fn feed(&mut self, event: MainEvent) {
        let from = self.machine.state();
        let effects = self.machine.handle(event);
        let to = self.machine.state();
        if from != to {
            tracing::trace!(?from, ?to, "Supervisor transition");
        }
        for effect in effects {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::StartWatcher => self.start_watcher(),
            Effect::CloseWatcher => {
                self.watch = None;
                self.notify(Event::Watcher(WatcherEvent::Stopped));
            }
            Effect::SpawnChild(incarnation) => {
                self.worker = Some(WorkerProcess::spawn(
                    &self.config,
                    incarnation,
                    self.events.clone(),
                ));
            }
            Effect::StopChild(incarnation) => {
                if let Some(worker) = self
                    .worker
                    .as_mut()
                    .filter(|worker| worker.incarnation() == incarnation)
                {
                    worker.terminate();
                }
            }
            Effect::ClearCallbacks => {
                tracing::trace!(count = self.callbacks.len(), "Clearing host callbacks");
                self.callbacks.clear();
            }
            Effect::ReleaseBuffered {
                incarnation,
                readiness,
            } => {
                for function_id in self.registry.buffered_function_ids() {
                    if readiness.is_callable(&function_id) {
                        self.drain(&function_id, incarnation);
                        continue;
                    }
                    let count = self.registry.reject_all(
                        &function_id,
                        ModuleError::InvalidModuleType(NOT_A_FUNCTION.to_string()),
                    );
                    self.logger
                        .notice(&Notice::BufferedExecutionsTerminated { function_id, count });
                }
            }
            Effect::Drain {
                function_id,
                incarnation,
            } => self.drain(&function_id, incarnation),
            Effect::RejectExecution {
                execution_id,
                error,
            } => self.registry.reject(execution_id, error),
            Effect::RejectBuffered(error) => {
                self.registry.reject_buffered(error);
            }
            Effect::AbandonInFlight { incarnation, error } => {
                let count = self.registry.abandon(incarnation, error);
                if count > 0 {
                    tracing::debug!(%incarnation, count, "Rejected executions of exited worker");
                }
            }
            Effect::RecreateModule => {
                self.slot.recreate();
                let _ = self.lifecycle.send(LifecycleEvent::Restart);
            }
            Effect::ResolveModule(readiness) => {
                self.slot.resolve(readiness);
                let _ = self.lifecycle.send(LifecycleEvent::Ready);
            }
            Effect::RejectModule(error) => {
                self.slot.reject(error.clone());
                let _ = self.lifecycle.send(LifecycleEvent::Failed(error));
            }
            Effect::ResolveRestarts(ack) => {
                for waiter in self.restart_waiters.drain(..) {
                    let _ = waiter.send(Ok(ack));
                }
            }
            Effect::RejectRestarts(error) => {
                for waiter in self.restart_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
            Effect::ResolveKills => {
                for waiter in self.kill_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
            Effect::Teardown => {
                self.worker = None;
                self.watch = None;
                self.callbacks.clear();
                tracing::debug!(pending = self.registry.len(), "Module killed");
            }
            Effect::Log(notice) => self.logger.notice(&notice),
        }
    }

    fn start_watcher(&mut self) {
        if !self.config.disabled {
            match SourceWatch::start(&self.config.watch, self.config.debounce, self.events.clone()) {
                Ok(watch) => self.watch = Some(watch),
                Err(e) => tracing::warn!("Watching disabled: {}", e),
            }
        }
        self.notify(Event::Watcher(WatcherEvent::Ready));
    }

    /// Send every buffered call of `function_id` to the worker.
    fn drain(&mut self, function_id: &str, incarnation: Incarnation) {
        let Some(worker) = self
            .worker
            .as_ref()
            .filter(|worker| worker.incarnation() == incarnation)
        else {
            return;
        };

        for (execution_id, args) in self.registry.drain(function_id, incarnation) {
            let args = marshal(args, |callback| self.callbacks.register(callback));
            worker.send(HostMessage::Execute {
                function_id: function_id.to_string(),
                execution_id,
                args,
            });
        }
    }

    /// Queue an event for this actor.
    fn notify(&self, event: Event) {
        let _ = self.events.send(event);
    }
}
