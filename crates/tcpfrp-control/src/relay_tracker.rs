//! Tracking of active relay pairs
//!
//! Each running relay holds a [`RelayGuard`]; dropping the guard removes the
//! entry. Graceful shutdown uses [`RelayTracker::wait_idle`] to let in-flight
//! relays finish before sessions are closed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tcpfrp_proto::SessionToken;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInfo {
    pub id: u64,
    pub session: SessionToken,
    pub proxy: String,
    pub peer: SocketAddr,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RelayTracker {
    next_id: AtomicU64,
    active: DashMap<u64, RelayInfo>,
    idle: Notify,
}

impl RelayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a relay as active until the returned guard is dropped
    pub fn track(self: &Arc<Self>, session: SessionToken, proxy: &str, peer: SocketAddr) -> RelayGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            id,
            RelayInfo {
                id,
                session,
                proxy: proxy.to_string(),
                peer,
                started_at: Utc::now(),
            },
        );

        RelayGuard {
            tracker: self.clone(),
            id,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn count_for_session(&self, session: &SessionToken) -> usize {
        self.active
            .iter()
            .filter(|entry| entry.session == *session)
            .count()
    }

    pub fn snapshot(&self) -> Vec<RelayInfo> {
        let mut relays: Vec<_> = self.active.iter().map(|entry| entry.value().clone()).collect();
        relays.sort_by_key(|relay| relay.id);
        relays
    }

    /// Resolves once no relay is active
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self, id: u64) {
        self.active.remove(&id);
        if self.active.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Keeps a relay registered in its [`RelayTracker`]
#[derive(Debug)]
pub struct RelayGuard {
    tracker: Arc<RelayTracker>,
    id: u64,
}

impl RelayGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "203.0.113.7:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_track_and_release() {
        let tracker = Arc::new(RelayTracker::new());
        let s1 = SessionToken::from("s1");

        let a = tracker.track(s1.clone(), "web", peer());
        let b = tracker.track(s1.clone(), "web", peer());
        let _c = tracker.track(SessionToken::from("s2"), "db", peer());

        assert_eq!(tracker.active_count(), 3);
        assert_eq!(tracker.count_for_session(&s1), 2);
        assert_ne!(a.id(), b.id());

        let ids: Vec<u64> = tracker.snapshot().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id(), b.id(), a.id() + 2]);

        drop(a);
        drop(b);
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(tracker.count_for_session(&s1), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let tracker = RelayTracker::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_until_last_relay_finishes() {
        let tracker = Arc::new(RelayTracker::new());
        let first = tracker.track(SessionToken::from("s1"), "web", peer());
        let second = tracker.track(SessionToken::from("s1"), "web", peer());

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(first);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
