//! The pairing-time collector task
//!
//! [`DiscoveryCoordinator::start`] spawns one task per session. The task owns
//! the [`LiveSession`], records what the router's collector tap forwards, ticks
//! on a fixed interval and reports the candidate list exactly once.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::inference::{finalize, CandidateDevice};
use super::session::{DiscoverySession, LiveSession, TickOutcome};
use crate::capability::catalog::CapabilityCatalog;
use crate::mqtt::message::BusMessage;
use crate::routing::router::MessageSink;
use crate::routing::topic::TopicPattern;

const COLLECTOR_CAPACITY: usize = 512;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The session was cancelled or replaced before it finalized
    #[error("Discovery session abandoned")]
    Abandoned,
}

pub type DiscoveryResult = Result<Vec<CandidateDevice>, DiscoveryError>;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Topics meters publish on; the `+` segment is the device id
    pub pattern: String,
    pub tick_interval_secs: u64,
    /// Quiet ticks in a row before the candidate set counts as complete
    pub stable_ticks: u32,
    /// Candidates with fewer inferred capabilities are discarded
    pub min_capabilities: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            pattern: "watts/+/measurement".to_string(),
            tick_interval_secs: 7,
            stable_ticks: 2,
            min_capabilities: 2,
        }
    }
}

impl DiscoverySettings {
    pub fn topic_pattern(&self) -> TopicPattern {
        TopicPattern::new(self.pattern.as_str())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryCoordinator {
    settings: DiscoverySettings,
    catalog: CapabilityCatalog,
}

/// Everything a started session hands back.
pub struct DiscoveryRun {
    /// Control side, kept by whoever owns the router
    pub handle: DiscoveryHandle,
    /// Attach to the router as the collector tap
    pub collector: MessageSink,
    /// Resolves once with the candidates
    pub outcome: DiscoveryOutcome,
}

/// Control over a running session.
#[derive(Debug)]
pub struct DiscoveryHandle {
    pattern: TopicPattern,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl DiscoveryHandle {
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Stops the session without a result. The pairing side sees `Abandoned`.
    pub fn abandon(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves when the session task has ended, for any reason.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }
}

/// The pairing side of a session.
#[derive(Debug)]
pub struct DiscoveryOutcome {
    result: oneshot::Receiver<DiscoveryResult>,
}

impl DiscoveryOutcome {
    pub async fn complete(self) -> DiscoveryResult {
        self.result.await.unwrap_or(Err(DiscoveryError::Abandoned))
    }
}

impl DiscoveryCoordinator {
    pub fn new(settings: DiscoverySettings) -> Self {
        Self {
            settings,
            catalog: CapabilityCatalog::default(),
        }
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    /// Starts a fresh session that skips every topic in `ignore`.
    pub fn start(&self, ignore: BTreeSet<String>) -> DiscoveryRun {
        let (collector, inbound) = mpsc::channel(COLLECTOR_CAPACITY);
        let (result_tx, result) = oneshot::channel();
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let pattern = self.settings.topic_pattern();

        info!(
            "Starting discovery on {} ignoring {} claimed topics",
            pattern,
            ignore.len()
        );
        let session = DiscoverySession::create(ignore, self.settings.stable_ticks).start();

        tokio::spawn(run_session(
            session.into(),
            inbound,
            SessionContext {
                pattern: pattern.clone(),
                catalog: self.catalog,
                tick: self.settings.tick_interval(),
                min_capabilities: self.settings.min_capabilities,
            },
            cancel.clone(),
            finished.clone(),
            result_tx,
        ));

        DiscoveryRun {
            handle: DiscoveryHandle {
                pattern,
                cancel,
                finished,
            },
            collector,
            outcome: DiscoveryOutcome { result },
        }
    }
}

struct SessionContext {
    pattern: TopicPattern,
    catalog: CapabilityCatalog,
    tick: Duration,
    min_capabilities: usize,
}

async fn run_session(
    mut session: LiveSession,
    mut inbound: mpsc::Receiver<BusMessage>,
    ctx: SessionContext,
    cancel: CancellationToken,
    finished: CancellationToken,
    result_tx: oneshot::Sender<DiscoveryResult>,
) {
    let mut ticker = interval_at(Instant::now() + ctx.tick, ctx.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Discovery abandoned");
                break Err(DiscoveryError::Abandoned);
            }
            Some(msg) = inbound.recv() => {
                if ctx.pattern.matches(&msg.topic) {
                    session.record(&msg.topic, msg.payload);
                }
            }
            _ = ticker.tick() => {
                match session.tick() {
                    TickOutcome::Continue(next) => {
                        debug!(
                            "Discovery tick: {} topics, stabilizing: {}",
                            next.topic_count(),
                            next.is_stabilizing()
                        );
                        session = next;
                    }
                    TickOutcome::Finalized(done) => {
                        let candidates = finalize(
                            done.observed(),
                            &ctx.pattern,
                            &ctx.catalog,
                            ctx.min_capabilities,
                        );
                        info!(
                            "Discovery finalized: {} topics, {} candidates",
                            done.topic_count(),
                            candidates.len()
                        );
                        break Ok(candidates);
                    }
                }
            }
        }
    };

    if result_tx.send(result).is_err() {
        debug!("Nobody waiting for the discovery result");
    }
    finished.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    const READING: &str = r#"{"positive_active_power": 100, "voltage_l1": 230}"#;

    #[tokio::test(start_paused = true)]
    async fn test_session_finalizes_after_quiet_ticks() {
        let coordinator = DiscoveryCoordinator::default();
        let run = coordinator.start(BTreeSet::new());

        for id in ["A", "B", "C"] {
            let topic = format!("watts/{}/measurement", id);
            run.collector
                .send(BusMessage::new(topic, READING, 1))
                .await
                .unwrap();
        }

        let candidates = run.outcome.complete().await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert!(run.handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_session_reports_error() {
        let coordinator = DiscoveryCoordinator::default();
        let run = coordinator.start(BTreeSet::new());
        run.handle.abandon();
        assert_eq!(run.outcome.complete().await, Err(DiscoveryError::Abandoned));
        run.handle.finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_topics_yield_no_candidates() {
        let coordinator = DiscoveryCoordinator::default();
        let ignore = BTreeSet::from(["watts/A/measurement".to_string()]);
        let run = coordinator.start(ignore);
        run.collector
            .send(BusMessage::new("watts/A/measurement", READING, 1))
            .await
            .unwrap();

        assert_eq!(run.outcome.complete().await, Ok(Vec::new()));
    }
}
