//! Topic routing
//!
//! [`Router`] decides which single handler gets an inbound message, and during
//! pairing also feeds the discovery collector.

pub mod router;
pub mod topic;

pub use router::{Dispatch, MessageSink, Router};
pub use topic::TopicPattern;
