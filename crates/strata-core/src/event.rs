use tokio::sync::broadcast;

use crate::trace::TraceEvent;

/// Live feed of trace events from every run that shares it.
///
/// Runs publish through their `TraceRecorder`; sinks such as the JSONL trace
/// logger subscribe and filter on `run_id`. A subscriber that falls more than
/// `capacity` events behind sees `RecvError::Lagged` and skips ahead. The
/// recorder's own list is unaffected.
pub struct EventBus {
    tx: broadcast::Sender<TraceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send an event to current subscribers. Returns how many received it.
    pub fn publish(&self, event: TraceEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.tx.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{RunId, RunStatus, TraceRecorder};
    use std::sync::Arc;

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = Arc::new(EventBus::default());
        assert!(!bus.has_subscribers());

        let rec = TraceRecorder::new(RunId::new()).with_bus(bus.clone());
        rec.record_finished(0, RunStatus::Completed);
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn test_every_subscriber_receives_each_event() {
        let bus = Arc::new(EventBus::new(4));
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert!(bus.has_subscribers());

        let rec = TraceRecorder::new(RunId::new()).with_bus(bus.clone());
        rec.record_start(1, "a", 1);

        assert_eq!(first.try_recv().unwrap().node.as_deref(), Some("a"));
        assert_eq!(second.try_recv().unwrap().node.as_deref(), Some("a"));
    }

    #[test]
    fn test_slow_subscriber_lags() {
        let bus = Arc::new(EventBus::new(2));
        let mut rx = bus.subscribe();
        let rec = TraceRecorder::new(RunId::new()).with_bus(bus.clone());
        for attempt in 1..=4 {
            rec.record_start(1, "a", attempt);
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(2))
        ));
        assert_eq!(rec.len(), 4);
    }
}
