pub mod telegram;

pub use telegram::TelegramSink;

use crate::error::BalancerError;
use crate::upstream::{HealthState, NodeId, Transition};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Destination for operator notifications.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), BalancerError>;
}

#[derive(Debug, Clone, Copy)]
struct DownRecord {
    since: SystemTime,
    last_notified: Option<SystemTime>,
}

/// Turns health transitions into availability notifications and periodic
/// reminders for nodes that stay down.
pub struct Notifier {
    sink: Arc<dyn AlertSink>,
    reminder_interval: Duration,
    origin: String,
    down: DashMap<NodeId, DownRecord>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn AlertSink>, reminder_interval: Duration) -> Self {
        let origin = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self::with_origin(sink, reminder_interval, origin)
    }

    pub fn with_origin(
        sink: Arc<dyn AlertSink>,
        reminder_interval: Duration,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            reminder_interval,
            origin: origin.into(),
            down: DashMap::new(),
        }
    }

    pub fn down_count(&self) -> usize {
        self.down.len()
    }

    pub async fn on_transition(&self, t: &Transition) {
        match (t.from, t.to) {
            (HealthState::Unknown, HealthState::Down) => {
                // Never seen up; the reminder pass reports it.
                self.down.insert(
                    t.node.clone(),
                    DownRecord {
                        since: t.at,
                        last_notified: None,
                    },
                );
            }
            (_, HealthState::Down) => {
                let text = format!(
                    "⚠️ <b>Node unavailable:</b> {}\nState: {} -> down\nBalancer: {}",
                    escape(&t.node.to_string()),
                    t.from,
                    escape(&self.origin)
                );
                self.deliver(&text, &t.node).await;
                self.down.insert(
                    t.node.clone(),
                    DownRecord {
                        since: t.at,
                        last_notified: Some(SystemTime::now()),
                    },
                );
            }
            (HealthState::Down, HealthState::Healthy) => {
                if self.down.remove(&t.node).is_some() {
                    let text = format!(
                        "✅ <b>Node available again:</b> {}\nBalancer: {}",
                        escape(&t.node.to_string()),
                        escape(&self.origin)
                    );
                    self.deliver(&text, &t.node).await;
                }
            }
            _ => {}
        }
    }

    /// Remind about every node still down whose last notification is absent
    /// or older than the reminder interval.
    pub async fn send_reminders(&self, now: SystemTime) {
        let due: Vec<(NodeId, DownRecord)> = self
            .down
            .iter()
            .filter(|e| match e.value().last_notified {
                None => true,
                Some(at) => now
                    .duration_since(at)
                    .is_ok_and(|elapsed| elapsed >= self.reminder_interval),
            })
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        for (node, record) in due {
            let hours = now
                .duration_since(record.since)
                .unwrap_or_default()
                .as_secs_f64()
                / 3600.0;
            let text = format!(
                "⏰ <b>Reminder:</b> node {} is still unavailable, down for {:.1} h\nBalancer: {}",
                escape(&node.to_string()),
                hours,
                escape(&self.origin)
            );
            self.deliver(&text, &node).await;
            if let Some(mut entry) = self.down.get_mut(&node) {
                entry.last_notified = Some(now);
            }
        }
    }

    /// Forget nodes that left the registry.
    pub fn retain(&self, keep: impl Fn(&NodeId) -> bool) {
        self.down.retain(|id, _| keep(id));
    }

    async fn deliver(&self, text: &str, node: &NodeId) {
        match self.sink.send(text).await {
            Ok(()) => {
                info!("alert: notification sent, node={}", node);
                metrics::counter!("balancer_alerts_total", "result" => "sent").increment(1);
            }
            Err(e) => {
                warn!("alert: notification failed, node={}, error={}", node, e);
                metrics::counter!("balancer_alerts_total", "result" => "error").increment(1);
            }
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, text: &str) -> Result<(), BalancerError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        async fn send(&self, _text: &str) -> Result<(), BalancerError> {
            Err(BalancerError::Alert("unreachable".to_string()))
        }
    }

    fn transition(from: HealthState, to: HealthState, at: SystemTime) -> Transition {
        Transition {
            node: NodeId::new("10.0.0.1", 8443),
            from,
            to,
            count: 3,
            at,
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_down_and_recovery_messages() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::with_origin(sink.clone(), 6 * HOUR, "lb-1");
        let now = SystemTime::now();

        notifier.on_transition(&transition(HealthState::Degraded, HealthState::Down, now)).await;
        assert_eq!(notifier.down_count(), 1);

        notifier.on_transition(&transition(HealthState::Down, HealthState::Healthy, now)).await;
        assert_eq!(notifier.down_count(), 0);

        let messages = sink.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("Node unavailable"));
        assert!(messages[0].contains("10.0.0.1:8443"));
        assert!(messages[0].contains("lb-1"));
        assert!(messages[1].contains("Node available again"));
    }

    #[tokio::test]
    async fn test_unknown_to_down_is_silent_until_reminder() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::with_origin(sink.clone(), 6 * HOUR, "lb-1");
        let went_down = SystemTime::now();

        notifier.on_transition(&transition(HealthState::Unknown, HealthState::Down, went_down)).await;
        assert!(sink.messages().is_empty());

        notifier.send_reminders(went_down + 2 * HOUR).await;
        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Reminder"));
        assert!(messages[0].contains("down for 2.0 h"));
    }

    #[tokio::test]
    async fn test_reminders_respect_interval() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::with_origin(sink.clone(), 6 * HOUR, "lb-1");
        let start = SystemTime::now();

        notifier.on_transition(&transition(HealthState::Degraded, HealthState::Down, start)).await;
        notifier.send_reminders(start + HOUR).await;
        assert_eq!(sink.messages().len(), 1);

        notifier.send_reminders(start + 7 * HOUR).await;
        assert_eq!(sink.messages().len(), 2);

        notifier.send_reminders(start + 8 * HOUR).await;
        assert_eq!(sink.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_degraded_transitions_are_not_alerted() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::with_origin(sink.clone(), HOUR, "lb-1");
        let now = SystemTime::now();
        notifier.on_transition(&transition(HealthState::Healthy, HealthState::Degraded, now)).await;
        notifier.on_transition(&transition(HealthState::Degraded, HealthState::Healthy, now)).await;
        notifier.on_transition(&transition(HealthState::Unknown, HealthState::Healthy, now)).await;
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_state() {
        let notifier = Notifier::with_origin(Arc::new(FailingSink), HOUR, "lb-1");
        notifier
            .on_transition(&transition(HealthState::Healthy, HealthState::Down, SystemTime::now()))
            .await;
        assert_eq!(notifier.down_count(), 1);
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
