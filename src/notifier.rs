//! Per-session readiness broadcast.
//!
//! Each session owns one `watch` channel holding its terminal readiness
//! event. Subscribers wait until the value is set; a subscriber arriving
//! after the event already fired sees the cached value immediately.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// Terminal outcome of one activation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReadinessEvent {
    /// Worker is servable at `endpoint`.
    Ready {
        /// URL the participant interacts with.
        endpoint: String,
    },
    /// Activation attempt failed.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },
}

type Slot = watch::Sender<Option<ReadinessEvent>>;

/// Broadcasts readiness events to any number of observers per session.
#[derive(Debug, Default)]
pub struct ReadinessNotifier {
    channels: Mutex<HashMap<String, Slot>>,
}

impl ReadinessNotifier {
    /// Create an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe the current attempt for `session_id`.
    #[must_use]
    pub fn subscribe(&self, session_id: &str) -> ReadinessSubscription {
        let mut channels = self.lock();
        let sender = channels
            .entry(session_id.to_owned())
            .or_insert_with(|| watch::channel(None).0);
        ReadinessSubscription {
            rx: sender.subscribe(),
        }
    }

    /// Publish the terminal event for the current attempt.
    ///
    /// The first event wins; later publishes for the same attempt are
    /// ignored. Returns whether this call set the event.
    pub fn publish(&self, session_id: &str, event: ReadinessEvent) -> bool {
        let mut channels = self.lock();
        let sender = channels
            .entry(session_id.to_owned())
            .or_insert_with(|| watch::channel(None).0);

        let mut event = Some(event);
        let fired = sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = event.take();
            true
        });

        if fired {
            debug!(session_id, "readiness event published");
        }
        fired
    }

    /// Event of the current attempt, if one fired.
    #[must_use]
    pub fn current(&self, session_id: &str) -> Option<ReadinessEvent> {
        self.lock()
            .get(session_id)
            .and_then(|sender| sender.borrow().clone())
    }

    /// Start a new attempt. Existing subscribers keep waiting for its event.
    pub fn reset(&self, session_id: &str) {
        if let Some(sender) = self.lock().get(session_id) {
            sender.send_replace(None);
        }
    }

    /// Forget the session. Pending subscribers resolve with `None`.
    pub fn remove(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One observer of a session's readiness.
#[derive(Debug)]
pub struct ReadinessSubscription {
    rx: watch::Receiver<Option<ReadinessEvent>>,
}

impl ReadinessSubscription {
    /// Wait for the terminal event.
    ///
    /// Returns `None` if the session is removed before an event fires.
    pub async fn wait(mut self) -> Option<ReadinessEvent> {
        let event = self.rx.wait_for(Option::is_some).await.ok()?;
        event.clone()
    }
}
