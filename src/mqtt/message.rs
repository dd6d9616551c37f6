use chrono::{DateTime, Local};
use std::fmt;

/// One inbound bus message, tagged with its topic.
///
/// `epoch` identifies the connector session that produced the message. The
/// bridge drops anything whose epoch does not match the live session, so a
/// torn-down connector can never feed the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
    pub epoch: u64,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, epoch: u64) -> Self {
        BusMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
            epoch,
        }
    }

    /// Payload as text. Invalid UTF-8 is replaced rather than rejected.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.payload_str();
        let preview: String = text.chars().take(40).collect();
        write!(
            f,
            "{} {} - {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview
        )
    }
}
