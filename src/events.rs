use tokio::sync::broadcast;

use crate::job::Job;
use crate::registry::JobType;

/// Notifications published by a [`Queue`](crate::Queue).
///
/// Delivered in emission order. Subscribers only see events sent after they subscribed.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Ready,
    Error(String),
    Shutdown,
    QueueJobs(Vec<Job>),
    RegisterJobType(JobType),
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: QueueEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}
