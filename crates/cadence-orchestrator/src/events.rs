use cadence_core::{CadenceResult, DomainEvent, Notifier};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Fans events out to in-process subscribers. Lagging subscribers lose
/// the oldest events; having no subscriber is not an error.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastNotifier {
    /// Channel keeping up to `capacity` unread events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver seeing events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn emit(&self, event: DomainEvent) -> CadenceResult<()> {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Writes every event to the tracing pipeline.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn emit(&self, event: DomainEvent) -> CadenceResult<()> {
        info!(
            target: "cadence::events",
            event = %event.kind,
            scope = event.scope.as_deref().unwrap_or("-"),
            payload = %event.payload,
            "event"
        );
        Ok(())
    }
}

/// Forwards each event to several notifiers. Every notifier sees every
/// event; the first failure is returned.
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    /// Forward to `targets` in order.
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }
}

impl Notifier for FanoutNotifier {
    fn emit(&self, event: DomainEvent) -> CadenceResult<()> {
        let mut first_err = None;
        for target in &self.targets {
            if let Err(e) = target.emit(event.clone()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
