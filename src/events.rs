use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::agent::AgentMessage;
use crate::features::Feature;
use crate::orchestrator::StatusSnapshot;
use crate::sessions::SessionStatus;

/// Per-subscriber buffer for the live agent-output firehose only.
const LIVE_CAPACITY: usize = 256;

/// Everything observers can see. Dashboard and HTTP layers subscribe;
/// the scheduler only publishes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Event {
    OrchestratorStatus(StatusSnapshot),
    SessionStarted {
        session_id: String,
        feature_id: u64,
        track: String,
    },
    SessionFinished {
        session_id: String,
        feature_id: u64,
        track: String,
        status: SessionStatus,
    },
    FeatureUpdated(Feature),
    AgentOutput {
        session_id: String,
        message: AgentMessage,
    },
    TrackCriticalFailure {
        track: String,
        reason: String,
    },
    NewCategories {
        categories: Vec<String>,
    },
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::OrchestratorStatus(_) => "orchestrator:status",
            Self::SessionStarted { .. } => "session:started",
            Self::SessionFinished { .. } => "session:finished",
            Self::FeatureUpdated(_) => "feature:updated",
            Self::AgentOutput { .. } => "agent:output",
            Self::TrackCriticalFailure { .. } => "track:critical_failure",
            Self::NewCategories { .. } => "tracks:new_categories",
        }
    }

    /// Status, session, and feature events must reach every subscriber;
    /// only the live `agent:output` stream may drop under load.
    fn is_live(&self) -> bool {
        matches!(self, Self::AgentOutput { .. })
    }
}

/// Fan-out of scheduler events to observers. Publishing never blocks.
///
/// Two planes: control events (status, sessions, features, alerts) go out
/// on unbounded per-subscriber queues and are never dropped; the
/// `agent:output` firehose goes out on a bounded broadcast channel where a
/// lagging subscriber loses the oldest messages instead of stalling a
/// track loop.
pub struct EventBus {
    control: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
    live: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            control: Mutex::new(Vec::new()),
            live,
        }
    }

    /// Publish to all current subscribers. No subscribers is not an error.
    pub fn publish(&self, event: Event) {
        tracing::debug!(topic = event.topic(), "publish");
        if event.is_live() {
            let _ = self.live.send(event);
        } else {
            let mut subscribers = self.lock_control();
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_control().push(tx);
        EventStream {
            control: rx,
            live: self.live.subscribe(),
            live_open: true,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock_control();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<Event>>> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the bus. Control events are delivered
/// losslessly and take priority; live output may skip ahead when the
/// subscriber cannot keep up.
pub struct EventStream {
    control: mpsc::UnboundedReceiver<Event>,
    live: broadcast::Receiver<Event>,
    live_open: bool,
}

impl EventStream {
    /// Next event, or None once the bus is gone and the queues are drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if !self.live_open {
                return self.control.recv().await;
            }
            tokio::select! {
                biased;
                event = self.control.recv() => return event,
                event = self.live.recv() => match event {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "live subscriber lagged, oldest output dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => self.live_open = false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_event(i: usize) -> Event {
        Event::AgentOutput {
            session_id: "s1".into(),
            message: AgentMessage::system_note(format!("m{i}")),
        }
    }

    fn finished_event() -> Event {
        Event::SessionFinished {
            session_id: "s1".into(),
            feature_id: 1,
            track: "main".into(),
            status: SessionStatus::Passed,
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(Event::NewCategories {
            categories: vec!["api".into()],
        });

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.topic(), "tracks:new_categories");
        assert_eq!(e2.topic(), "tracks:new_categories");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(Event::TrackCriticalFailure {
            track: "backend".into(),
            reason: "db down".into(),
        });
    }

    #[tokio::test]
    async fn per_session_order_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(live_event(i));
        }
        for i in 0..5 {
            let event = rx.recv().await.unwrap();
            let Event::AgentOutput { message, .. } = event else {
                panic!("expected agent output");
            };
            assert_eq!(message.content.as_deref(), Some(format!("m{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn control_events_survive_live_overflow() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        // Flood the live plane well past its buffer, then emit the kind of
        // event the scheduler must never lose.
        for i in 0..(LIVE_CAPACITY + 50) {
            bus.publish(live_event(i));
        }
        bus.publish(finished_event());

        // The control event arrives first (priority) and intact.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic(), "session:finished");

        // The live plane lagged: the next output is not m0, the window
        // advanced past the dropped prefix.
        let next = rx.recv().await.unwrap();
        let Event::AgentOutput { message, .. } = next else {
            panic!("expected agent output");
        };
        assert_eq!(message.content.as_deref(), Some("m50"));

        // Control stays lossless afterwards too.
        bus.publish(Event::NewCategories {
            categories: vec!["late".into()],
        });
        loop {
            let event = rx.recv().await.unwrap();
            if event.topic() == "tracks:new_categories" {
                break;
            }
            assert_eq!(event.topic(), "agent:output");
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing to the pruned list is harmless
        bus.publish(finished_event());
    }

    #[test]
    fn topics_match_wire_names() {
        let event = Event::SessionStarted {
            session_id: "s".into(),
            feature_id: 1,
            track: "t".into(),
        };
        assert_eq!(event.topic(), "session:started");
    }
}
