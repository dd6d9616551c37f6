//! Liveness tracking and the staleness check behind forced reconnects
//!
//! The transport is never asked whether it is alive. The only evidence is the
//! locally observed time of the last message; a periodic tick compares it to a
//! threshold and declares the connector stale.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Timing for the health monitor.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSettings {
    /// How often the staleness check runs
    pub check_interval_secs: u64,
    /// Silence longer than this forces a reconnect
    pub stale_after_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            stale_after_secs: 10 * 60,
        }
    }
}

impl HealthSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Per-connector record of when traffic was last seen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    last_message_at: Option<Instant>,
    attempted: bool,
}

impl Liveness {
    /// Records traffic at `at`. The timestamp never moves backwards.
    pub fn observe(&mut self, at: Instant) {
        self.attempted = true;
        self.last_message_at = Some(match self.last_message_at {
            Some(last) if last > at => last,
            _ => at,
        });
    }

    /// Forgets the timestamp after a failed or torn-down session, so the next
    /// check retries.
    pub fn reset_after_attempt(&mut self) {
        self.last_message_at = None;
        self.attempted = true;
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        self.last_message_at
    }

    pub fn is_fresh(&self, now: Instant, stale_after: Duration) -> bool {
        self.last_message_at
            .is_some_and(|last| now.saturating_duration_since(last) <= stale_after)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Traffic within the threshold
    Healthy,
    /// Nothing attempted yet
    Idle,
    /// Silent for too long, or no traffic at all after an attempt
    StaleConnection { silent_for: Option<Duration> },
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(settings: HealthSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    pub fn evaluate(&self, liveness: &Liveness, now: Instant) -> HealthVerdict {
        match liveness.last_message_at {
            None if !liveness.attempted => HealthVerdict::Idle,
            None => HealthVerdict::StaleConnection { silent_for: None },
            Some(last) => {
                let silent_for = now.saturating_duration_since(last);
                if silent_for > self.settings.stale_after() {
                    HealthVerdict::StaleConnection {
                        silent_for: Some(silent_for),
                    }
                } else {
                    HealthVerdict::Healthy
                }
            }
        }
    }
}
