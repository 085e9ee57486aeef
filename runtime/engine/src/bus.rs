//! In-process publish/subscribe backbone.
//!
//! Each topic is its own broadcast channel: per-topic publish order is
//! preserved per subscriber, there is no ordering across topics, and a slow
//! subscriber lags (dropping its oldest backlog) rather than stalling the
//! publisher. Publishing with no subscribers is a no-op.

use config_core::Diagnostic;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 64;

/// Outcome of a reload attempt, with the full diagnostics of that attempt.
#[derive(Debug, Clone)]
pub enum ReloadNotice {
    Committed { diagnostics: Vec<Diagnostic> },
    Rejected { diagnostics: Vec<Diagnostic> },
}

/// A normalized hardware trigger observed by the dispatcher.
#[derive(Debug, Clone)]
pub struct TriggerNotice {
    pub device: String,
    pub value: u8,
    pub timestamp_ms: u64,
}

/// Progress of one step of one macro invocation.
#[derive(Debug, Clone)]
pub struct ActionNotice {
    pub macro_id: String,
    pub step_index: usize,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DiagnosticsNotice {
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    reload: broadcast::Sender<ReloadNotice>,
    trigger: broadcast::Sender<TriggerNotice>,
    action: broadcast::Sender<ActionNotice>,
    diagnostics: broadcast::Sender<DiagnosticsNotice>,
}

impl EventBus {
    pub fn new() -> Self {
        let (reload, _) = broadcast::channel(TOPIC_CAPACITY);
        let (trigger, _) = broadcast::channel(TOPIC_CAPACITY);
        let (action, _) = broadcast::channel(TOPIC_CAPACITY);
        let (diagnostics, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            reload,
            trigger,
            action,
            diagnostics,
        }
    }

    pub fn publish_reload(&self, notice: ReloadNotice) {
        let _ = self.reload.send(notice);
    }

    pub fn publish_trigger(&self, notice: TriggerNotice) {
        let _ = self.trigger.send(notice);
    }

    pub fn publish_action(&self, notice: ActionNotice) {
        let _ = self.action.send(notice);
    }

    pub fn publish_diagnostics(&self, notice: DiagnosticsNotice) {
        let _ = self.diagnostics.send(notice);
    }

    pub fn subscribe_reload(&self) -> broadcast::Receiver<ReloadNotice> {
        self.reload.subscribe()
    }

    pub fn subscribe_trigger(&self) -> broadcast::Receiver<TriggerNotice> {
        self.trigger.subscribe()
    }

    pub fn subscribe_action(&self) -> broadcast::Receiver<ActionNotice> {
        self.action.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticsNotice> {
        self.diagnostics.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block_or_panic() {
        let bus = EventBus::new();
        bus.publish_trigger(TriggerNotice {
            device: "pad".into(),
            value: 60,
            timestamp_ms: 0,
        });
    }

    #[tokio::test]
    async fn per_topic_order_is_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_trigger();
        for value in [1u8, 2, 3] {
            bus.publish_trigger(TriggerNotice {
                device: "pad".into(),
                value,
                timestamp_ms: 0,
            });
        }
        assert_eq!(rx.recv().await.expect("recv").value, 1);
        assert_eq!(rx.recv().await.expect("recv").value, 2);
        assert_eq!(rx.recv().await.expect("recv").value, 3);
    }

    #[tokio::test]
    async fn subscribers_are_independent_per_topic() {
        let bus = EventBus::new();
        let mut reload_rx = bus.subscribe_reload();
        let mut action_rx = bus.subscribe_action();

        bus.publish_reload(ReloadNotice::Committed {
            diagnostics: vec![],
        });
        bus.publish_action(ActionNotice {
            macro_id: "copy".into(),
            step_index: 0,
            outcome: StepOutcome::Completed,
        });

        assert!(matches!(
            reload_rx.recv().await.expect("reload"),
            ReloadNotice::Committed { .. }
        ));
        assert_eq!(action_rx.recv().await.expect("action").macro_id, "copy");
    }
}
