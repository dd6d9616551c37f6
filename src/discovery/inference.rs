//! Turns recorded discovery traffic into candidate devices

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use super::session::ObservedTopics;
use crate::capability::catalog::{parse_reading, CapabilityCatalog};
use crate::routing::topic::TopicPattern;

/// A meter seen during pairing, with the capabilities its payloads support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateDevice {
    pub id: String,
    pub name: String,
    pub topic: String,
    pub capabilities: BTreeSet<String>,
}

/// Infers candidates from `observed`.
///
/// A capability is included when at least one payload for the topic carries a
/// non-null value for its field. Candidates with fewer than `min_capabilities`
/// are noise and are dropped. Output is ordered by topic and depends only on
/// the recorded payloads.
pub fn finalize(
    observed: &ObservedTopics,
    pattern: &TopicPattern,
    catalog: &CapabilityCatalog,
    min_capabilities: usize,
) -> Vec<CandidateDevice> {
    let mut candidates = Vec::new();

    for (topic, payloads) in observed {
        let mut capabilities = BTreeSet::new();
        for payload in payloads {
            match parse_reading(topic, payload) {
                Ok(reading) => capabilities.extend(catalog.capabilities_present(&reading)),
                Err(e) => warn!("Skipping payload during discovery: {}", e),
            }
        }

        if capabilities.len() < min_capabilities {
            debug!(
                "Discarding {} with {} capabilities",
                topic,
                capabilities.len()
            );
            continue;
        }

        let id = pattern.device_id(topic).unwrap_or(topic.as_str()).to_string();
        candidates.push(CandidateDevice {
            name: format!("Device {}", id),
            id,
            topic: topic.clone(),
            capabilities,
        });
    }

    candidates
}
