//! Discovery session state machine
//!
//! ```text
//! Idle ──start──► Scanning ──tick (no new topic)──► Stabilizing ──tick (no new topic)──► Finalized
//!                    ▲                                   │
//!                    └────────tick (new topic)───────────┘
//! ```
//!
//! Payloads are recorded per topic in arrival order. A tick compares the
//! number of distinct observed topics with the count at the previous tick;
//! `stable_ticks` unchanged ticks in a row finalize the session.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Local};
use statum::{machine, state};
use tracing::debug;

/// Raw payloads per topic, in the order they arrived.
pub type ObservedTopics = BTreeMap<String, Vec<Vec<u8>>>;

#[state]
#[derive(Debug, Clone)]
pub enum DiscoveryState {
    Idle,
    Scanning,
    Stabilizing,
    Finalized,
}

#[machine]
#[derive(Debug)]
pub struct DiscoverySession<S: DiscoveryState> {
    // Topics already owned by a registered device
    ignore: BTreeSet<String>,
    observed: ObservedTopics,
    started_at: Option<DateTime<Local>>,
    last_count: usize,
    stable_rounds: u32,
    stable_ticks: u32,
}

impl<S: DiscoveryState> DiscoverySession<S> {
    pub fn observed(&self) -> &ObservedTopics {
        &self.observed
    }

    pub fn topic_count(&self) -> usize {
        self.observed.len()
    }

    pub fn stable_rounds(&self) -> u32 {
        self.stable_rounds
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    pub fn is_ignored(&self, topic: &str) -> bool {
        self.ignore.contains(topic)
    }

    fn store(&mut self, topic: &str, payload: Vec<u8>) -> bool {
        if self.ignore.contains(topic) {
            return false;
        }
        match self.observed.get_mut(topic) {
            Some(payloads) => payloads.push(payload),
            None => {
                debug!("Discovery saw new topic {}", topic);
                self.observed.insert(topic.to_string(), vec![payload]);
            }
        }
        true
    }

    /// Counts this tick as stable or not and returns the stable streak.
    fn settle(&mut self) -> u32 {
        let count = self.observed.len();
        if count == self.last_count {
            self.stable_rounds += 1;
        } else {
            self.stable_rounds = 0;
            self.last_count = count;
        }
        self.stable_rounds
    }
}

impl DiscoverySession<Idle> {
    /// A session that will finalize after `stable_ticks` quiet ticks (at least one).
    pub fn create(ignore: BTreeSet<String>, stable_ticks: u32) -> Self {
        Self::new(
            ignore,
            ObservedTopics::new(),
            None,
            0,
            0,
            stable_ticks.max(1),
        )
    }

    pub fn start(mut self) -> DiscoverySession<Scanning> {
        self.observed.clear();
        self.started_at = Some(Local::now());
        self.last_count = 0;
        self.stable_rounds = 0;
        self.transition()
    }
}

impl DiscoverySession<Scanning> {
    pub fn tick(mut self) -> TickOutcome {
        let rounds = self.settle();
        if rounds >= self.stable_ticks {
            TickOutcome::Finalized(self.transition())
        } else if rounds > 0 {
            TickOutcome::Continue(LiveSession::Stabilizing(self.transition()))
        } else {
            TickOutcome::Continue(LiveSession::Scanning(self))
        }
    }
}

impl DiscoverySession<Stabilizing> {
    pub fn tick(mut self) -> TickOutcome {
        let rounds = self.settle();
        if rounds >= self.stable_ticks {
            TickOutcome::Finalized(self.transition())
        } else if rounds > 0 {
            TickOutcome::Continue(LiveSession::Stabilizing(self))
        } else {
            debug!("New topic during stabilization, scanning again");
            TickOutcome::Continue(LiveSession::Scanning(self.transition()))
        }
    }
}

impl DiscoverySession<Finalized> {
    pub fn into_observed(self) -> ObservedTopics {
        self.observed
    }
}

/// A session that still accepts payloads.
#[derive(Debug)]
pub enum LiveSession {
    Scanning(DiscoverySession<Scanning>),
    Stabilizing(DiscoverySession<Stabilizing>),
}

#[derive(Debug)]
pub enum TickOutcome {
    Continue(LiveSession),
    Finalized(DiscoverySession<Finalized>),
}

impl LiveSession {
    /// Records one payload. Ignored topics are skipped and return false.
    pub fn record(&mut self, topic: &str, payload: Vec<u8>) -> bool {
        match self {
            LiveSession::Scanning(session) => session.store(topic, payload),
            LiveSession::Stabilizing(session) => session.store(topic, payload),
        }
    }

    pub fn tick(self) -> TickOutcome {
        match self {
            LiveSession::Scanning(session) => session.tick(),
            LiveSession::Stabilizing(session) => session.tick(),
        }
    }

    pub fn topic_count(&self) -> usize {
        match self {
            LiveSession::Scanning(session) => session.topic_count(),
            LiveSession::Stabilizing(session) => session.topic_count(),
        }
    }

    pub fn is_stabilizing(&self) -> bool {
        matches!(self, LiveSession::Stabilizing(_))
    }
}

impl From<DiscoverySession<Scanning>> for LiveSession {
    fn from(session: DiscoverySession<Scanning>) -> Self {
        LiveSession::Scanning(session)
    }
}
