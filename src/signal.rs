// Lifecycle signals.
// Focus and visibility transitions raised by the host and observed by queries and auth.

use tokio::sync::broadcast;

/// Foreground/background transitions of the hosting application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The window regained focus.
    Focus,
    /// The application became visible.
    Visible,
    /// The application went to the background.
    Hidden,
}

/// Broadcast hub for lifecycle events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Signals {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

impl Signals {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(32);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; returns how many listeners received it.
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn focus(&self) -> usize {
        self.emit(LifecycleEvent::Focus)
    }

    pub fn visible(&self) -> usize {
        self.emit(LifecycleEvent::Visible)
    }

    pub fn hidden(&self) -> usize {
        self.emit(LifecycleEvent::Hidden)
    }
}

/// Wait for the next occurrence of `wanted`, or None once the hub is gone.
pub async fn next_event(
    receiver: &mut broadcast::Receiver<LifecycleEvent>,
    wanted: LifecycleEvent,
) -> Option<()> {
    loop {
        match receiver.recv().await {
            Ok(event) if event == wanted => return Some(()),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
