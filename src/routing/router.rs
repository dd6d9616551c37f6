//! Topic → handler dispatch for one connector

use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::topic::TopicPattern;
use crate::mqtt::message::BusMessage;

/// Where a registered handler receives its messages.
pub type MessageSink = mpsc::Sender<BusMessage>;

struct WildcardRoute {
    pattern: TopicPattern,
    sink: MessageSink,
}

struct CollectorTap {
    pattern: TopicPattern,
    sink: MessageSink,
}

/// What happened to one inbound message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// A registered handler received it
    pub delivered: bool,
    /// The discovery collector received it
    pub collected: bool,
}

/// Maps topics to handlers.
///
/// Exact registrations win over wildcard ones; among wildcards the earliest
/// registration wins. Delivery never blocks: a full or closed handler loses
/// the message and the router moves on.
#[derive(Default)]
pub struct Router {
    exact: HashMap<String, MessageSink>,
    wildcards: Vec<WildcardRoute>,
    collector: Option<CollectorTap>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` for `topic`, replacing any previous handler for the same
    /// topic or pattern. Returns true when a handler was replaced.
    pub fn register(&mut self, topic: &str, sink: MessageSink) -> bool {
        let pattern = TopicPattern::new(topic);
        if !pattern.is_wildcard() {
            return self.exact.insert(topic.to_string(), sink).is_some();
        }

        match self
            .wildcards
            .iter_mut()
            .find(|route| route.pattern == pattern)
        {
            Some(route) => {
                route.sink = sink;
                true
            }
            None => {
                self.wildcards.push(WildcardRoute { pattern, sink });
                false
            }
        }
    }

    /// Removes the handler for `topic`. Unknown topics are a no-op.
    pub fn unregister(&mut self, topic: &str) -> bool {
        if self.exact.remove(topic).is_some() {
            return true;
        }
        let before = self.wildcards.len();
        self.wildcards.retain(|route| route.pattern.as_str() != topic);
        before != self.wildcards.len()
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.exact.contains_key(topic)
            || self
                .wildcards
                .iter()
                .any(|route| route.pattern.as_str() == topic)
    }

    /// Every registered topic and pattern, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: BTreeSet<String> = self.exact.keys().cloned().collect();
        topics.extend(self.wildcards.iter().map(|route| route.pattern.to_string()));
        topics.into_iter().collect()
    }

    /// Exact topics already owned by a device.
    pub fn claimed_topics(&self) -> BTreeSet<String> {
        self.exact.keys().cloned().collect()
    }

    /// Forwards every message matching `pattern` to `sink` as well, until detached.
    pub fn attach_collector(&mut self, pattern: TopicPattern, sink: MessageSink) {
        if self.collector.is_some() {
            debug!("Replacing discovery collector");
        }
        self.collector = Some(CollectorTap { pattern, sink });
    }

    pub fn detach_collector(&mut self) -> bool {
        self.collector.take().is_some()
    }

    pub fn collector_pattern(&self) -> Option<&TopicPattern> {
        self.collector.as_ref().map(|tap| &tap.pattern)
    }

    /// The handler responsible for `topic`, if any.
    pub fn route(&self, topic: &str) -> Option<&MessageSink> {
        if let Some(sink) = self.exact.get(topic) {
            return Some(sink);
        }
        self.wildcards
            .iter()
            .find(|route| route.pattern.matches(topic))
            .map(|route| &route.sink)
    }

    pub fn dispatch(&mut self, msg: BusMessage) -> Dispatch {
        let mut outcome = Dispatch::default();

        let collector_wants = self
            .collector
            .as_ref()
            .is_some_and(|tap| tap.pattern.matches(&msg.topic));

        if let Some(sink) = self.route(&msg.topic) {
            let copy = if collector_wants { Some(msg.clone()) } else { None };
            outcome.delivered = deliver(sink, msg, "handler");
            if let Some(copy) = copy {
                outcome.collected = self.collect(copy);
            }
            return outcome;
        }

        if collector_wants {
            outcome.collected = self.collect(msg);
        } else {
            debug!("No handler for {}, dropped", msg.topic);
        }
        outcome
    }

    fn collect(&mut self, msg: BusMessage) -> bool {
        let Some(tap) = self.collector.as_ref() else {
            return false;
        };
        match tap.sink.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!("Discovery collector full, dropped {}", msg.topic);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Discovery collector closed, detaching");
                self.collector = None;
                false
            }
        }
    }
}

fn deliver(sink: &MessageSink, msg: BusMessage, what: &str) -> bool {
    match sink.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            warn!("{} for {} is busy, message dropped", what, msg.topic);
            false
        }
        Err(TrySendError::Closed(msg)) => {
            debug!("{} for {} is gone, message dropped", what, msg.topic);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str) -> BusMessage {
        BusMessage::new(topic, "{}", 1)
    }

    #[test]
    fn test_exact_topics_are_isolated() {
        let mut router = Router::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        router.register("watts/A/measurement", tx_a);
        router.register("watts/B/measurement", tx_b);

        let outcome = router.dispatch(msg("watts/A/measurement"));
        assert!(outcome.delivered);
        assert_eq!(rx_a.try_recv().unwrap().topic, "watts/A/measurement");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_reregistration_replaces_handler() {
        let mut router = Router::new();
        let (first, mut first_rx) = mpsc::channel(4);
        let (second, mut second_rx) = mpsc::channel(4);
        assert!(!router.register("watts/X/measurement", first));
        assert!(router.register("watts/X/measurement", second));

        router.dispatch(msg("watts/X/measurement"));
        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_ok());
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let mut router = Router::new();
        let (wild, mut wild_rx) = mpsc::channel(4);
        let (exact, mut exact_rx) = mpsc::channel(4);
        router.register("watts/+/measurement", wild);
        router.register("watts/A/measurement", exact);

        router.dispatch(msg("watts/A/measurement"));
        assert!(exact_rx.try_recv().is_ok());
        assert!(wild_rx.try_recv().is_err());

        router.dispatch(msg("watts/B/measurement"));
        assert!(wild_rx.try_recv().is_ok());
    }

    #[test]
    fn test_unmatched_message_is_dropped() {
        let mut router = Router::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.register("watts/+/measurement", tx);

        let outcome = router.dispatch(msg("watts/A/extra/measurement"));
        assert_eq!(outcome, Dispatch::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let mut router = Router::new();
        assert!(!router.unregister("watts/none/measurement"));
        let (tx, _rx) = mpsc::channel(4);
        router.register("watts/A/measurement", tx);
        assert!(router.unregister("watts/A/measurement"));
        assert!(!router.is_registered("watts/A/measurement"));
    }

    #[test]
    fn test_collector_sees_claimed_and_unclaimed() {
        let mut router = Router::new();
        let (device, mut device_rx) = mpsc::channel(4);
        let (collector, mut collector_rx) = mpsc::channel(4);
        router.register("watts/A/measurement", device);
        router.attach_collector(TopicPattern::new("watts/+/measurement"), collector);

        let claimed = router.dispatch(msg("watts/A/measurement"));
        assert!(claimed.delivered && claimed.collected);
        let unclaimed = router.dispatch(msg("watts/B/measurement"));
        assert!(!unclaimed.delivered && unclaimed.collected);
        let foreign = router.dispatch(msg("other/B/measurement"));
        assert!(!foreign.collected);

        assert!(device_rx.try_recv().is_ok());
        assert_eq!(collector_rx.try_recv().unwrap().topic, "watts/A/measurement");
        assert_eq!(collector_rx.try_recv().unwrap().topic, "watts/B/measurement");
        assert!(collector_rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_collector_detaches() {
        let mut router = Router::new();
        let (collector, collector_rx) = mpsc::channel(4);
        router.attach_collector(TopicPattern::new("watts/+/measurement"), collector);
        drop(collector_rx);

        router.dispatch(msg("watts/B/measurement"));
        assert!(router.collector_pattern().is_none());
    }

    #[test]
    fn test_full_handler_does_not_block() {
        let mut router = Router::new();
        let (slow, mut slow_rx) = mpsc::channel(1);
        let (fast, mut fast_rx) = mpsc::channel(4);
        router.register("watts/A/measurement", slow);
        router.register("watts/B/measurement", fast);

        router.dispatch(msg("watts/A/measurement"));
        let overflow = router.dispatch(msg("watts/A/measurement"));
        assert!(!overflow.delivered);
        router.dispatch(msg("watts/B/measurement"));

        assert!(slow_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_err());
        assert!(fast_rx.try_recv().is_ok());
    }
}
