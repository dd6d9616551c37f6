//! # MQTT connectivity
//!
//! Reaches the message bus through one of two bus client providers and hands
//! every inbound message to the rest of the bridge in a single shape.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs        - ConnectionConfig and the transport-relevant diff
//! ├── message.rs       - BusMessage, the unit flowing from connector to router
//! ├── error.rs         - ConnectError, PublishError, PayloadError
//! ├── connector.rs     - BusConnector interface, lifecycle states, factory
//! ├── direct.rs        - directly owned broker connection (rumqttc)
//! ├── tls.rs           - broker options and TLS material
//! ├── host.rs          - host-managed provider over a shared broker proxy
//! └── broker_proxy.rs  - rumqttc-backed process-wide proxy
//! ```
//!
//! Connectors only connect, subscribe and publish. They never retry on their
//! own: the bridge's health monitor owns reconnection for both providers.

pub mod broker_proxy;
pub mod config;
pub mod connector;
pub mod direct;
pub mod error;
pub mod host;
pub mod message;
pub mod tls;

#[cfg(test)]
mod test_broker;

pub use config::{ConnectionConfig, TransportKind};
pub use connector::{BusConnector, ConnectionState, ConnectorFactory, DefaultConnectorFactory, Ready};
pub use error::{ConnectError, PayloadError, PublishError};
pub use host::{HostBrokerProxy, ProxyError, ProxyEvent, SharedHostBroker};
pub use message::BusMessage;
