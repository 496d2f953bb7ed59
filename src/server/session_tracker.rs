//! Per-session token fingerprints driving proactive SSO.
//!
//! The tracker remembers which upstream token each client session was last
//! initialized with. A session is (re)propagated when it is new or when its
//! token fingerprint changes: a re-authentication yields a new identity
//! token, a silent refresh yields a new access token, and both must reach
//! the backends.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Fixed-width, non-reversible fingerprint of a token: the first 8 bytes of
/// its SHA-256 digest, hex encoded.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Outcome of recording a request against the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionObservation {
    /// First request seen for this session
    New,
    /// The session's token fingerprint changed
    TokenChanged,
    /// Same fingerprint as last time; only the timestamp was refreshed
    Unchanged,
}

impl SessionObservation {
    /// Whether SSO propagation must run.
    pub fn should_trigger(self) -> bool {
        !matches!(self, SessionObservation::Unchanged)
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    fingerprint: String,
    last_access: Instant,
}

/// Concurrent session-id → fingerprint table.
#[derive(Debug)]
pub struct SessionTracker {
    sessions: DashMap<String, SessionEntry>,
    ttl: Duration,
}

impl SessionTracker {
    /// Tracker that forgets sessions idle for longer than `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Record a request for `session_id` carrying `fingerprint`.
    pub fn observe(&self, session_id: &str, fingerprint: &str) -> SessionObservation {
        self.observe_at(session_id, fingerprint, Instant::now())
    }

    /// [`observe`](Self::observe) with an explicit clock.
    pub fn observe_at(&self, session_id: &str, fingerprint: &str, now: Instant) -> SessionObservation {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(SessionEntry {
                    fingerprint: fingerprint.to_string(),
                    last_access: now,
                });
                SessionObservation::New
            },
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.last_access = now;
                if entry.fingerprint == fingerprint {
                    SessionObservation::Unchanged
                } else {
                    entry.fingerprint = fingerprint.to_string();
                    SessionObservation::TokenChanged
                }
            },
        }
    }

    /// Fingerprint recorded for a session.
    pub fn fingerprint(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.fingerprint.clone())
    }

    /// Whether a session is tracked.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove sessions idle for longer than the TTL. Returns how many.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Instant::now())
    }

    /// [`cleanup_expired`](Self::cleanup_expired) with an explicit clock.
    pub fn cleanup_expired_at(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| now.saturating_duration_since(entry.last_access) <= self.ttl);
        before.saturating_sub(self.sessions.len())
    }

    /// Sweep on every `interval` until `shutdown` is cancelled.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("session cleanup stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.cleanup_expired();
                        if removed > 0 {
                            tracing::info!(removed, remaining = self.len(), "removed expired sessions");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_changed_unchanged() {
        let tracker = SessionTracker::new(Duration::from_secs(60));
        let a = hash_token("token-a");
        let b = hash_token("token-b");

        assert_eq!(tracker.observe("s1", &a), SessionObservation::New);
        assert_eq!(tracker.observe("s1", &a), SessionObservation::Unchanged);
        assert_eq!(tracker.observe("s1", &b), SessionObservation::TokenChanged);
        assert_eq!(tracker.observe("s1", &b), SessionObservation::Unchanged);
        assert_eq!(tracker.observe("s2", &b), SessionObservation::New);

        assert_eq!(tracker.fingerprint("s1"), Some(b));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn unchanged_observation_refreshes_timestamp() {
        let tracker = SessionTracker::new(Duration::from_secs(10));
        let start = Instant::now();
        let fp = hash_token("t");

        tracker.observe_at("s1", &fp, start);
        tracker.observe_at("s1", &fp, start + Duration::from_secs(8));
        assert_eq!(tracker.cleanup_expired_at(start + Duration::from_secs(15)), 0);
        assert_eq!(tracker.cleanup_expired_at(start + Duration::from_secs(19)), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn cleanup_only_removes_idle_sessions() {
        let tracker = SessionTracker::new(Duration::from_secs(10));
        let start = Instant::now();
        tracker.observe_at("old", "f1", start);
        tracker.observe_at("fresh", "f2", start + Duration::from_secs(9));

        assert_eq!(tracker.cleanup_expired_at(start + Duration::from_secs(12)), 1);
        assert!(!tracker.contains("old"));
        assert!(tracker.contains("fresh"));
    }

    #[tokio::test]
    async fn background_sweep_runs_until_shutdown() {
        let tracker = Arc::new(SessionTracker::new(Duration::from_millis(10)));
        tracker.observe("s1", "f1");

        let shutdown = CancellationToken::new();
        let handle = tracker
            .clone()
            .spawn_cleanup(Duration::from_millis(20), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(tracker.is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweep stops on shutdown")
            .unwrap();
    }

    #[test]
    fn fingerprint_is_sixteen_hex_chars() {
        assert_eq!(hash_token(""), "e3b0c44298fc1c14");
    }

    proptest! {
        #[test]
        fn fingerprints_are_fixed_width_and_deterministic(token in ".*") {
            let fp = hash_token(&token);
            prop_assert_eq!(fp.len(), 16);
            prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
            prop_assert_eq!(fp, hash_token(&token));
        }

        #[test]
        fn distinct_tokens_rarely_collide(a in "[a-z0-9]{8,32}", b in "[a-z0-9]{8,32}") {
            prop_assume!(a != b);
            prop_assert_ne!(hash_token(&a), hash_token(&b));
        }
    }
}
