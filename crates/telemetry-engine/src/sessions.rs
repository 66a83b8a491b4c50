use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::info;

use crate::types::SessionRecord;

pub const DEFAULT_SESSION_TIMEOUT_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionObservation {
    pub is_new: bool,
    pub active_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    pub evicted: Vec<String>,
    pub active_count: usize,
}

/// Session id → last-seen state with timeout-based eviction.
///
/// The active count is always `sessions.len()`; it is never stored separately.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    sessions: HashMap<String, DateTime<Utc>>,
    timeout: Duration,
}

impl SessionTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
        }
    }

    /// Create or refresh a session. Last write wins on `last_seen_at`.
    pub fn observe(&mut self, session_id: &str, now: DateTime<Utc>) -> SessionObservation {
        let is_new = self.sessions.insert(session_id.to_string(), now).is_none();
        let active_count = self.active_count();
        if is_new {
            info!(
                "New session detected: {}. Total active sessions: {}",
                session_id, active_count
            );
        }
        SessionObservation {
            is_new,
            active_count,
        }
    }

    /// Drop every session whose last observation is older than the timeout.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepOutcome {
        let timeout = self.timeout;
        let mut evicted = Vec::new();
        self.sessions.retain(|session_id, last_seen| {
            let stale = now.signed_duration_since(*last_seen) > timeout;
            if stale {
                evicted.push(session_id.clone());
            }
            !stale
        });

        for session_id in &evicted {
            info!("Session {} timed out and removed", session_id);
        }

        SweepOutcome {
            evicted,
            active_count: self.active_count(),
        }
    }

    /// Sessions seen within the timeout as of the last observe or sweep.
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Active sessions, most recently seen first.
    pub fn registry(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .sessions
            .iter()
            .map(|(session_id, last_seen_at)| SessionRecord {
                session_id: session_id.clone(),
                last_seen_at: *last_seen_at,
            })
            .collect();
        records.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        records
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_SESSION_TIMEOUT_SECS))
    }
}
