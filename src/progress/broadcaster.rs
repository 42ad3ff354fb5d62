//! Per-session progress fan-out.
//!
//! Each session owns a broadcast channel plus the latest event. Publishing
//! never blocks and never buffers history beyond that latest event; a new
//! subscriber receives it first, then live events.

use crate::models::ProgressEvent;
use futures::stream::{self, Stream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default per-session channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscriber fell behind and missed {0} event(s)")]
    Lagged(u64),

    #[error("progress channel closed")]
    Closed,
}

struct SessionChannel {
    tx: broadcast::Sender<ProgressEvent>,
    snapshot: Option<ProgressEvent>,
}

type Sessions = Mutex<HashMap<String, SessionChannel>>;

fn lock_sessions(sessions: &Sessions) -> MutexGuard<'_, HashMap<String, SessionChannel>> {
    // Critical sections never panic midway, so a poisoned map is still consistent.
    sessions.lock().unwrap_or_else(|e| e.into_inner())
}

/// Process-wide progress hub keyed by session id.
pub struct ProgressBroadcaster {
    sessions: Arc<Sessions>,
    capacity: usize,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn entry<'a>(
        &self,
        sessions: &'a mut HashMap<String, SessionChannel>,
        session_id: &str,
    ) -> &'a mut SessionChannel {
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionChannel {
                tx: broadcast::channel(self.capacity).0,
                snapshot: None,
            })
    }

    /// Announce a new run: resets the snapshot to zero progress.
    pub fn register(&self, session_id: &str, run_id: &str, total: usize) {
        self.publish(
            session_id,
            ProgressEvent::Progress {
                run_id: run_id.to_string(),
                completed: 0,
                total,
                categories_completed: Vec::new(),
            },
        );
    }

    /// Record `event` as the session's snapshot and fan it out.
    ///
    /// Events with no live subscriber are dropped; only the snapshot stays.
    pub fn publish(&self, session_id: &str, event: ProgressEvent) {
        let mut sessions = lock_sessions(&self.sessions);
        let channel = self.entry(&mut sessions, session_id);
        channel.snapshot = Some(event.clone());
        let delivered = channel.tx.send(event).unwrap_or(0);
        debug!("Published progress for session {} to {} subscriber(s)", session_id, delivered);
    }

    /// Attach to a session. The current snapshot, if any, is yielded first.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let mut sessions = lock_sessions(&self.sessions);
        let channel = self.entry(&mut sessions, session_id);
        let rx = channel.tx.subscribe();
        let pending = channel.snapshot.clone();

        Subscription {
            session_id: session_id.to_string(),
            pending,
            rx: Some(rx),
            sessions: Arc::downgrade(&self.sessions),
        }
    }

    /// Latest event for a session.
    pub fn snapshot(&self, session_id: &str) -> Option<ProgressEvent> {
        lock_sessions(&self.sessions)
            .get(session_id)
            .and_then(|c| c.snapshot.clone())
    }

    #[allow(dead_code)] // Used by tests and embedders
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        lock_sessions(&self.sessions)
            .get(session_id)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of sessions currently holding a channel.
    #[allow(dead_code)] // Used by tests and embedders
    pub fn session_count(&self) -> usize {
        lock_sessions(&self.sessions).len()
    }

    /// Drop a session's channel and snapshot. Live subscribers see `Closed`.
    #[allow(dead_code)] // Used by tests and embedders
    pub fn forget(&self, session_id: &str) {
        lock_sessions(&self.sessions).remove(session_id);
    }
}

/// Remove a session nobody is watching once its run is over.
fn prune(sessions: &Sessions, session_id: &str) {
    let mut sessions = lock_sessions(sessions);
    let idle = sessions.get(session_id).is_some_and(|c| {
        c.tx.receiver_count() == 0 && c.snapshot.as_ref().map_or(true, ProgressEvent::is_terminal)
    });
    if idle {
        sessions.remove(session_id);
        debug!("Released idle progress channel for session {}", session_id);
    }
}

/// A live attachment to one session's progress.
pub struct Subscription {
    session_id: String,
    pending: Option<ProgressEvent>,
    rx: Option<broadcast::Receiver<ProgressEvent>>,
    sessions: Weak<Sessions>,
}

impl Subscription {
    #[allow(dead_code)] // Used by tests and embedders
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event: the replayed snapshot first, then live events.
    pub async fn recv(&mut self) -> Result<ProgressEvent, SubscriptionError> {
        if let Some(event) = self.pending.take() {
            return Ok(event);
        }

        let rx = self.rx.as_mut().ok_or(SubscriptionError::Closed)?;
        match rx.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Err(SubscriptionError::Lagged(missed))
            }
            Err(broadcast::error::RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }

    /// Events as a stream that ends after the first terminal event.
    ///
    /// Lag is logged and skipped; use [`super::follow`] to resynchronize
    /// from a fresh snapshot instead.
    #[allow(dead_code)] // Used by tests and embedders
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        stream::unfold((self, false), |(mut sub, finished)| async move {
            if finished {
                return None;
            }
            loop {
                match sub.recv().await {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        return Some((event, (sub, terminal)));
                    }
                    Err(SubscriptionError::Lagged(missed)) => {
                        warn!("Progress stream for {} skipped {} event(s)", sub.session_id, missed);
                    }
                    Err(SubscriptionError::Closed) => return None,
                }
            }
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        if let Some(sessions) = self.sessions.upgrade() {
            prune(&sessions, &self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, ScoreBasis};
    use futures::StreamExt;
    use std::time::Duration;

    fn progress(completed: usize) -> ProgressEvent {
        ProgressEvent::Progress {
            run_id: "run".into(),
            completed,
            total: 3,
            categories_completed: vec![Category::Market],
        }
    }

    fn complete() -> ProgressEvent {
        ProgressEvent::Complete {
            run_id: "run".into(),
            overall_score: 70,
            readiness: 7,
            score_basis: ScoreBasis::Scored,
            failed_dimensions: 0,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_keeps_snapshot() {
        let hub = ProgressBroadcaster::default();
        hub.publish("s", progress(1));
        hub.publish("s", progress(2));
        assert_eq!(hub.snapshot("s"), Some(progress(2)));
        assert_eq!(hub.subscriber_count("s"), 0);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_snapshot_immediately() {
        let hub = ProgressBroadcaster::default();
        hub.register("s", "run", 3);
        hub.publish("s", progress(2));

        let mut sub = hub.subscribe("s");
        let first = tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .expect("snapshot should be immediate")
            .unwrap();
        assert_eq!(first, progress(2));

        hub.publish("s", complete());
        assert_eq!(sub.recv().await.unwrap(), complete());
    }

    #[tokio::test]
    async fn test_many_subscribers_see_same_events() {
        let hub = ProgressBroadcaster::default();
        let mut a = hub.subscribe("s");
        let mut b = hub.subscribe("s");
        assert_eq!(hub.subscriber_count("s"), 2);

        hub.publish("s", progress(1));
        assert_eq!(a.recv().await.unwrap(), progress(1));
        assert_eq!(b.recv().await.unwrap(), progress(1));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let hub = ProgressBroadcaster::default();
        let mut other = hub.subscribe("other");
        hub.publish("s", progress(1));
        assert!(tokio::time::timeout(Duration::from_millis(20), other.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_releases_finished_session() {
        let hub = ProgressBroadcaster::default();
        let sub = hub.subscribe("s");
        hub.publish("s", progress(1));
        drop(sub);
        // Run still in flight: snapshot retained for reconnecting clients.
        assert_eq!(hub.session_count(), 1);

        let sub = hub.subscribe("s");
        hub.publish("s", complete());
        drop(sub);
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_subscription_to_unknown_session_is_reclaimed() {
        let hub = ProgressBroadcaster::default();
        drop(hub.subscribe("ghost"));
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_lag_is_reported() {
        let hub = ProgressBroadcaster::new(2);
        let mut sub = hub.subscribe("s");
        for i in 0..5 {
            hub.publish("s", progress(i));
        }
        assert!(matches!(sub.recv().await, Err(SubscriptionError::Lagged(_))));
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal_event() {
        let hub = ProgressBroadcaster::default();
        hub.publish("s", progress(1));
        let stream = hub.subscribe("s").into_stream();
        hub.publish("s", progress(2));
        hub.publish("s", complete());
        hub.publish("s", progress(0));

        let events: Vec<ProgressEvent> = stream.collect().await;
        assert_eq!(events, vec![progress(1), progress(2), complete()]);
    }

    #[tokio::test]
    async fn test_forget_closes_subscribers() {
        let hub = ProgressBroadcaster::default();
        let mut sub = hub.subscribe("s");
        hub.forget("s");
        assert_eq!(sub.recv().await, Err(SubscriptionError::Closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publish_subscribe_and_drop() {
        const EVENTS: usize = 200;
        let hub = Arc::new(ProgressBroadcaster::new(1024));
        // Keeps the session alive so late watchers always find a snapshot.
        let anchor = hub.subscribe("s");

        let watch = |hub: Arc<ProgressBroadcaster>| {
            tokio::spawn(async move {
                let mut sub = hub.subscribe("s");
                let mut seen = Vec::new();
                loop {
                    let event = sub.recv().await.unwrap();
                    let terminal = event.is_terminal();
                    seen.push(event);
                    if terminal {
                        return seen;
                    }
                }
            })
        };

        let early: Vec<_> = (0..8).map(|_| watch(Arc::clone(&hub))).collect();
        let churners: Vec<_> = (0..4)
            .map(|_| {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        drop(hub.subscribe("s"));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        let publisher = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                for completed in 1..=EVENTS {
                    hub.publish("s", progress(completed));
                    if completed % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                hub.publish("s", complete());
            })
        };
        let late: Vec<_> = (0..4).map(|_| watch(Arc::clone(&hub))).collect();

        publisher.await.unwrap();
        for churner in churners {
            churner.await.unwrap();
        }
        for watcher in early.into_iter().chain(late) {
            let seen = watcher.await.unwrap();
            assert_eq!(seen.last(), Some(&complete()));
            let counts: Vec<usize> = seen
                .iter()
                .filter_map(|e| match e {
                    ProgressEvent::Progress { completed, .. } => Some(*completed),
                    _ => None,
                })
                .collect();
            assert!(
                counts.windows(2).all(|pair| pair[0] < pair[1]),
                "events out of order or repeated: {:?}",
                counts
            );
        }

        assert_eq!(hub.snapshot("s"), Some(complete()));
        drop(anchor);
        assert_eq!(hub.session_count(), 0);
    }
}
