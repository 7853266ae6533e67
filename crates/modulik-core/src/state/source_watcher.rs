//! Lifecycle of the persistent source watcher.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceWatcherState {
    Starting,
    Ready,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherEvent {
    /// The watch is installed.
    Ready,
    /// Something under a watched path was added, changed or removed.
    Changed,
    StopRequested,
    /// The watch is closed.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherEffect {
    /// Tell the supervisor the module changed.
    NotifyChanged,
    /// Close the watch.
    Close,
}

/// Machine for the watcher: `starting -> ready -> stopping -> stopped`.
#[derive(Debug, Clone)]
pub struct SourceWatcher {
    state: SourceWatcherState,
}

impl Default for SourceWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceWatcher {
    pub fn new() -> Self {
        Self {
            state: SourceWatcherState::Starting,
        }
    }

    pub fn state(&self) -> SourceWatcherState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SourceWatcherState::Ready
    }

    pub fn is_stopped(&self) -> bool {
        self.state == SourceWatcherState::Stopped
    }

    pub fn handle(&mut self, event: WatcherEvent) -> Option<WatcherEffect> {
        use SourceWatcherState::*;

        match (self.state, event) {
            (Starting, WatcherEvent::Ready) => {
                self.state = Ready;
                None
            }
            (Ready, WatcherEvent::Changed) => Some(WatcherEffect::NotifyChanged),
            (Starting | Ready, WatcherEvent::StopRequested) => {
                self.state = Stopping;
                Some(WatcherEffect::Close)
            }
            (Starting | Ready | Stopping, WatcherEvent::Stopped) => {
                self.state = Stopped;
                None
            }
            _ => None,
        }
    }
}
