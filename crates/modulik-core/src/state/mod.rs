//! State machines coordinating one supervised module.
//!
//! The machines are pure: they take events and return effects, and never
//! touch processes, files or channels themselves. The supervisor actor
//! performs the effects and feeds the outcomes back as events.

mod child_process;
mod main;
mod source_watcher;

use std::fmt;

pub use child_process::{
    ChildEffect, ChildEvent, ChildProcess, ChildProcessContext, ChildProcessState, ExitReport,
    TRANSPILER_MISSING_EXIT_CODE,
};
pub use main::{Effect, KillPhase, MainEvent, MainMachine, MainState, RestartAck, RestartPhase};
pub use source_watcher::{SourceWatcher, SourceWatcherState, WatcherEffect, WatcherEvent};

/// One spawn-to-exit lifetime of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Incarnation(pub u64);

impl fmt::Display for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
