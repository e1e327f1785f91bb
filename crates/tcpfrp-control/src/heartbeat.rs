//! Heartbeat-based liveness tracking
//!
//! Every logged-in session has a last-seen instant. A background sweep runs at
//! a third of the timeout and reports each session whose last heartbeat is
//! older than the timeout exactly once.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tcpfrp_proto::SessionToken;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct HeartbeatMonitor {
    timeout: Duration,
    last_seen: DashMap<SessionToken, Instant>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: DashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sweep_interval(&self) -> Duration {
        (self.timeout / 3).max(Duration::from_millis(1))
    }

    /// Start tracking a session as of now
    pub fn register(&self, session: &SessionToken) {
        self.last_seen.insert(session.clone(), Instant::now());
    }

    /// Refresh a session's deadline. Returns false for untracked sessions.
    pub fn touch(&self, session: &SessionToken) -> bool {
        match self.last_seen.get_mut(session) {
            Some(mut last_seen) => {
                *last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session: &SessionToken) {
        self.last_seen.remove(session);
    }

    pub fn is_tracked(&self, session: &SessionToken) -> bool {
        self.last_seen.contains_key(session)
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Remove and return every session silent for longer than the timeout
    pub fn take_expired(&self, now: Instant) -> Vec<SessionToken> {
        let mut expired = Vec::new();
        self.last_seen.retain(|session, last_seen| {
            let alive = now.saturating_duration_since(*last_seen) <= self.timeout;
            if !alive {
                expired.push(session.clone());
            }
            alive
        });
        expired
    }

    /// Run the periodic sweep until `shutdown` fires
    pub fn spawn_sweeper<F>(
        self: Arc<Self>,
        shutdown: CancellationToken,
        on_expired: F,
    ) -> JoinHandle<()>
    where
        F: Fn(SessionToken) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Heartbeat sweeper started (every {:?})", self.sweep_interval());

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for session in self.take_expired(Instant::now()) {
                            warn!(
                                session = %session,
                                "No heartbeat for {:?}, tearing session down",
                                self.timeout
                            );
                            on_expired(session);
                        }
                    }
                }
            }

            debug!("Heartbeat sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_after_timeout() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        let session = SessionToken::from("s1");
        monitor.register(&session);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(monitor.take_expired(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(monitor.take_expired(Instant::now()), vec![session.clone()]);

        // Reported once, then forgotten
        assert!(!monitor.is_tracked(&session));
        assert!(monitor.take_expired(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_extends_deadline() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        let session = SessionToken::from("s1");
        monitor.register(&session);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(monitor.touch(&session));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(monitor.take_expired(Instant::now()).is_empty());
        assert!(monitor.is_tracked(&session));
    }

    #[test]
    fn test_touch_unknown_session() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        assert!(!monitor.touch(&SessionToken::from("ghost")));
        assert!(monitor.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reports_dead_sessions() {
        let monitor = Arc::new(HeartbeatMonitor::new(Duration::from_secs(9)));
        let alive = SessionToken::from("alive");
        let dead = SessionToken::from("dead");
        monitor.register(&alive);
        monitor.register(&dead);

        let reported = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();
        let sweeper = {
            let reported = reported.clone();
            monitor.clone().spawn_sweeper(shutdown.clone(), move |session| {
                reported.lock().unwrap().push(session);
            })
        };

        // Keep one session alive with a heartbeat every 3s
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            monitor.touch(&alive);
        }

        assert_eq!(*reported.lock().unwrap(), vec![dead]);
        assert!(monitor.is_tracked(&alive));

        shutdown.cancel();
        sweeper.await.unwrap();
    }
}
