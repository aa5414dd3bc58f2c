//! Per-consumer live push sessions.
//!
//! At most one push channel per consumer id. Channel lifecycle hooks
//! (stream completion, transport error, explicit disconnect) converge on a
//! single generation-checked teardown, so cleanup runs at most once per
//! channel instance and a stale teardown can never remove a replacement
//! session.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::events::{ConnectionEventPublisher, ConnectionEventType};
use crate::metrics;
use crate::models::RetainedMessage;

struct SessionEntry {
    session_id: u64,
    project_id: String,
    tx: mpsc::UnboundedSender<RetainedMessage>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// No client is attached; the persisted copy (if any) is the only
    /// record of the message.
    NoSession,
    /// The channel was broken; it has been torn down.
    ChannelClosed,
}

pub struct SessionManager {
    sessions: DashMap<String, SessionEntry>,
    next_session_id: AtomicU64,
    events: Arc<ConnectionEventPublisher>,
}

impl SessionManager {
    pub fn new(events: Arc<ConnectionEventPublisher>) -> Self {
        Self {
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            events,
        }
    }

    /// Open a push channel for this consumer. An existing entry for the
    /// same id is replaced in the mapping (its stream simply ends); the old
    /// channel's guard cannot tear the new one down.
    pub fn open(
        self: &Arc<Self>,
        consumer_id: &str,
        project_id: &str,
    ) -> (mpsc::UnboundedReceiver<RetainedMessage>, SessionGuard) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            consumer_id.to_string(),
            SessionEntry {
                session_id,
                project_id: project_id.to_string(),
                tx,
            },
        );
        metrics::SESSIONS_OPENED_TOTAL.inc();
        tracing::info!(consumer_id = %consumer_id, session_id, "Push session opened");
        (
            rx,
            SessionGuard {
                manager: Arc::clone(self),
                consumer_id: consumer_id.to_string(),
                session_id,
            },
        )
    }

    pub fn is_open(&self, consumer_id: &str) -> bool {
        self.sessions.contains_key(consumer_id)
    }

    /// Best-effort push to the live channel. A write to a broken channel
    /// tears it down and raises the disconnect notification.
    pub async fn push(&self, message: &RetainedMessage) -> PushOutcome {
        let (session_id, send_result) = {
            let Some(entry) = self.sessions.get(&message.consumer_id) else {
                tracing::debug!(
                    consumer_id = %message.consumer_id,
                    message_id = %message.message_id,
                    "No live session; message not pushed"
                );
                return PushOutcome::NoSession;
            };
            (entry.session_id, entry.tx.send(message.clone()))
        };

        match send_result {
            Ok(()) => {
                metrics::MESSAGES_DELIVERED_TOTAL.inc();
                PushOutcome::Delivered
            }
            Err(_) => {
                tracing::warn!(
                    consumer_id = %message.consumer_id,
                    "Push channel broken; tearing session down"
                );
                self.teardown(&message.consumer_id, session_id).await;
                PushOutcome::ChannelClosed
            }
        }
    }

    /// Explicit disconnect. Returns whether a channel was removed; the
    /// disconnect event is emitted only when one was.
    pub async fn close(&self, consumer_id: &str) -> bool {
        let Some((_, entry)) = self.sessions.remove(consumer_id) else {
            return false;
        };
        tracing::info!(consumer_id = %consumer_id, session_id = entry.session_id, "Push session closed");
        self.events
            .publish(
                consumer_id,
                &entry.project_id,
                ConnectionEventType::Disconnected,
            )
            .await;
        true
    }

    /// Generation-checked teardown shared by the push-failure path and the
    /// stream guard. Removes the entry only while it is still the same
    /// channel instance.
    pub async fn teardown(&self, consumer_id: &str, session_id: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(consumer_id, |_, entry| entry.session_id == session_id);
        let Some((_, entry)) = removed else {
            return false;
        };
        tracing::info!(consumer_id = %consumer_id, session_id, "Push session torn down");
        self.events
            .publish(
                consumer_id,
                &entry.project_id,
                ConnectionEventType::Disconnected,
            )
            .await;
        true
    }
}

/// Tied to one channel instance; dropping it (stream completion, transport
/// error, client gone) triggers the same teardown as every other hook.
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    consumer_id: String,
    session_id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let manager = Arc::clone(&self.manager);
        let consumer_id = std::mem::take(&mut self.consumer_id);
        let session_id = self.session_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                manager.teardown(&consumer_id, session_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(Arc::new(
            ConnectionEventPublisher::disabled(),
        )))
    }

    fn message(consumer_id: &str) -> RetainedMessage {
        RetainedMessage {
            message_id: "m-1".to_string(),
            consumer_id: consumer_id.to_string(),
            data: "payload".to_string(),
            queue: "q1".to_string(),
            expire_at: None,
        }
    }

    #[tokio::test]
    async fn push_reaches_the_open_channel() {
        let sessions = manager();
        let (mut rx, _guard) = sessions.open("c1", "p1");

        assert_eq!(sessions.push(&message("c1")).await, PushOutcome::Delivered);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.message_id, "m-1");
    }

    #[tokio::test]
    async fn push_without_a_session_is_a_drop() {
        let sessions = manager();
        assert_eq!(sessions.push(&message("c1")).await, PushOutcome::NoSession);
    }

    #[tokio::test]
    async fn broken_channel_is_torn_down_on_push() {
        let sessions = manager();
        let (rx, guard) = sessions.open("c1", "p1");
        drop(rx);

        assert_eq!(
            sessions.push(&message("c1")).await,
            PushOutcome::ChannelClosed
        );
        assert!(!sessions.is_open("c1"));
        // The guard's later drop must not fire a second teardown.
        drop(guard);
        assert_eq!(sessions.push(&message("c1")).await, PushOutcome::NoSession);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let sessions = manager();
        let (_rx, _guard) = sessions.open("c1", "p1");

        assert!(sessions.close("c1").await);
        assert!(!sessions.close("c1").await);
        assert!(!sessions.is_open("c1"));
    }

    #[tokio::test]
    async fn stale_guard_cannot_remove_a_replacement_session() {
        let sessions = manager();
        let (_rx1, guard1) = sessions.open("c1", "p1");
        let first_session_id = guard1.session_id;
        let (mut rx2, _guard2) = sessions.open("c1", "p1");

        // Simulates the first channel's lifecycle hook firing late.
        assert!(!sessions.teardown("c1", first_session_id).await);
        assert!(sessions.is_open("c1"));
        assert_eq!(sessions.push(&message("c1")).await, PushOutcome::Delivered);
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn teardown_runs_at_most_once_per_instance() {
        let sessions = manager();
        let (_rx, guard) = sessions.open("c1", "p1");
        let session_id = guard.session_id;

        assert!(sessions.teardown("c1", session_id).await);
        assert!(!sessions.teardown("c1", session_id).await);
    }
}
