//! Pairing-time device discovery
//!
//! A session passively records what meters publish on the discovery pattern,
//! waits until no new topic shows up for a few ticks and then infers each
//! candidate's capabilities from the fields it actually reported.

pub mod coordinator;
pub mod inference;
pub mod session;

pub use coordinator::{
    DiscoveryCoordinator, DiscoveryError, DiscoveryHandle, DiscoveryOutcome, DiscoveryResult,
    DiscoveryRun, DiscoverySettings,
};
pub use inference::{finalize, CandidateDevice};
pub use session::{DiscoverySession, LiveSession, ObservedTopics, TickOutcome};
