//! Client-side reconnection for progress observers.
//!
//! [`follow`] keeps an observer attached to a session until the run ends:
//! it resubscribes after lag or a closed channel with exponential backoff,
//! and pauses entirely while [`Connectivity`] reports offline.

use super::broadcaster::ProgressBroadcaster;
use crate::models::ProgressEvent;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Backoff settings for resubscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_attempts: Some(8),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based): doubles, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Attempt counter over a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Called after a successful delivery.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Shared online/offline signal.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            tx: Arc::new(watch::channel(online).0),
        }
    }

    #[allow(dead_code)] // Driven by embedders that watch the network
    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }

    #[allow(dead_code)] // Driven by embedders that watch the network
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FollowError {
    #[error("gave up following progress after {attempts} reconnect attempt(s)")]
    GaveUp { attempts: u32 },
}

/// Resolves once connectivity reports `want`. Pends forever if the signal
/// can no longer change.
async fn until(online: &mut watch::Receiver<bool>, want: bool) {
    if online.wait_for(|v| *v == want).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Observe a session until its run reaches a terminal event.
///
/// Every (re)subscription starts from the replayed snapshot, so missed
/// events are never needed.
pub async fn follow<F>(
    broadcaster: &ProgressBroadcaster,
    session_id: &str,
    policy: &ReconnectPolicy,
    connectivity: &Connectivity,
    mut on_event: F,
) -> Result<ProgressEvent, FollowError>
where
    F: FnMut(&ProgressEvent),
{
    let mut backoff = Backoff::new(policy.clone());
    let mut online = connectivity.watch();

    loop {
        until(&mut online, true).await;

        let mut subscription = broadcaster.subscribe(session_id);
        loop {
            tokio::select! {
                received = subscription.recv() => match received {
                    Ok(event) => {
                        backoff.reset();
                        on_event(&event);
                        if event.is_terminal() {
                            return Ok(event);
                        }
                    }
                    Err(e) => {
                        warn!("Progress subscription for {} interrupted: {}", session_id, e);
                        break;
                    }
                },
                _ = until(&mut online, false) => {
                    debug!("Offline; pausing progress for {}", session_id);
                    break;
                }
            }
        }
        drop(subscription);

        match backoff.next_delay() {
            Some(delay) => {
                debug!("Resubscribing to {} in {:?}", session_id, delay);
                tokio::time::sleep(delay).await;
            }
            None => {
                return Err(FollowError::GaveUp {
                    attempts: backoff.attempts(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, ScoreBasis};
    use std::sync::Mutex;

    fn progress(completed: usize) -> ProgressEvent {
        ProgressEvent::Progress {
            run_id: "run".into(),
            completed,
            total: 2,
            categories_completed: vec![Category::Team],
        }
    }

    fn complete() -> ProgressEvent {
        ProgressEvent::Complete {
            run_id: "run".into(),
            overall_score: 50,
            readiness: 5,
            score_basis: ScoreBasis::Scored,
            failed_dimensions: 0,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_ceiling() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(700));
        assert_eq!(policy.delay_for(40), Duration::from_millis(700));
    }

    #[test]
    fn test_backoff_exhausts_and_resets() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            max_attempts: Some(2),
        });
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_follow_returns_terminal_snapshot() {
        let hub = ProgressBroadcaster::default();
        hub.publish("s", complete());

        let mut seen = Vec::new();
        let result = follow(
            &hub,
            "s",
            &ReconnectPolicy::default(),
            &Connectivity::default(),
            |e| seen.push(e.clone()),
        )
        .await;

        assert_eq!(result, Ok(complete()));
        assert_eq!(seen, vec![complete()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_waits_while_offline() {
        let hub = Arc::new(ProgressBroadcaster::default());
        hub.publish("s", progress(1));
        let connectivity = Connectivity::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let hub = hub.clone();
            let connectivity = connectivity.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                follow(&hub, "s", &ReconnectPolicy::default(), &connectivity, |e| {
                    seen.lock().unwrap().push(e.clone())
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(seen.lock().unwrap().is_empty());

        connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), &[progress(1)]);

        hub.publish("s", complete());
        assert_eq!(task.await.unwrap(), Ok(complete()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_resubscribes_after_lag() {
        let hub = Arc::new(ProgressBroadcaster::new(1));
        hub.publish("s", progress(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let hub = hub.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                follow(
                    &hub,
                    "s",
                    &ReconnectPolicy::default(),
                    &Connectivity::default(),
                    |e| seen.lock().unwrap().push(e.clone()),
                )
                .await
            })
        };

        // Let the follower consume the snapshot and park on recv.
        tokio::time::sleep(Duration::from_millis(1)).await;
        hub.publish("s", progress(1));
        hub.publish("s", progress(2));
        hub.publish("s", complete());

        assert_eq!(task.await.unwrap(), Ok(complete()));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&progress(0)));
        assert_eq!(seen.last(), Some(&complete()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_gives_up_when_channel_keeps_closing() {
        let hub = Arc::new(ProgressBroadcaster::default());
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            max_attempts: Some(2),
        };

        let task = {
            let hub = hub.clone();
            tokio::spawn(async move {
                follow(&hub, "s", &policy, &Connectivity::default(), |_| {}).await
            })
        };

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            hub.forget("s");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(task.await.unwrap(), Err(FollowError::GaveUp { attempts: 2 }));
    }
}
