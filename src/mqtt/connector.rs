//! Transport abstraction shared by both bus client providers
//!
//! Every policy above this module (health, routing, discovery) talks to a
//! [`BusConnector`] and never asks which provider is behind it.
//!
//! ```text
//! DirectConnector ─┐
//!                  ├─► Ready { inbound: mpsc::Receiver<BusMessage> } ─► Bridge ─► Router
//! HostManaged ─────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::config::{ConnectionConfig, TransportKind};
use super::direct::DirectConnector;
use super::error::{ConnectError, PublishError};
use super::host::{HostManagedConnector, SharedHostBroker};
use super::message::BusMessage;

/// Buffer between a provider's receive pump and the bridge loop.
pub const INBOUND_CAPACITY: usize = 256;

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Allocates the identifier for a new connector session.
pub fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    Stale,
}

/// Handed out by a successful [`BusConnector::connect`].
///
/// All inbound traffic of the session, whatever subscription produced it,
/// arrives on `inbound`. The channel closes when the session ends.
///
/// Providers whose upstream announces its return set `recovered`; it fires
/// once after the session was lost and the upstream is usable again.
#[derive(Debug)]
pub struct Ready {
    pub inbound: mpsc::Receiver<BusMessage>,
    pub epoch: u64,
    pub recovered: Option<oneshot::Receiver<()>>,
}

impl Ready {
    pub fn new(inbound: mpsc::Receiver<BusMessage>, epoch: u64) -> Self {
        Self {
            inbound,
            epoch,
            recovered: None,
        }
    }

    pub fn with_recovery(mut self, recovered: oneshot::Receiver<()>) -> Self {
        self.recovered = Some(recovered);
        self
    }
}

/// One bus client provider with a normalised lifecycle.
///
/// Connectors never retry on their own; reconnection is driven by the health
/// monitor so both providers share one policy.
#[async_trait]
pub trait BusConnector: Send {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> ConnectionState;

    async fn connect(&mut self, config: &ConnectionConfig) -> Result<Ready, ConnectError>;

    /// Tears the session down. Once this returns, the session's pump no longer
    /// produces messages.
    async fn disconnect(&mut self);

    async fn subscribe(&mut self, topic: &str) -> Result<(), PublishError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), PublishError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    /// After a failed `connect`, a signal that fires once the upstream is
    /// usable again. Providers that can not tell return `None`.
    fn take_recovery(&mut self) -> Option<oneshot::Receiver<()>> {
        None
    }
}

/// Builds connectors for a config. The bridge asks for a fresh one after
/// every teardown.
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn BusConnector>;
}

/// Picks the provider from `config.transport`.
#[derive(Clone, Default)]
pub struct DefaultConnectorFactory {
    host: Option<SharedHostBroker>,
}

impl DefaultConnectorFactory {
    pub fn new(host: Option<SharedHostBroker>) -> Self {
        Self { host }
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn BusConnector> {
        match config.transport {
            TransportKind::Direct => Box::new(DirectConnector::new()),
            TransportKind::HostManaged => Box::new(HostManagedConnector::new(self.host.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epochs_are_unique() {
        let a = next_epoch();
        let b = next_epoch();
        assert!(b > a);
    }

    #[test]
    fn test_factory_selects_provider() {
        let factory = DefaultConnectorFactory::new(None);
        let direct = factory.create(&ConnectionConfig::default());
        assert_eq!(direct.kind(), TransportKind::Direct);
        assert_eq!(direct.state(), ConnectionState::Disconnected);

        let host = factory.create(&ConnectionConfig::host_managed());
        assert_eq!(host.kind(), TransportKind::HostManaged);
    }

    #[tokio::test]
    async fn test_host_managed_without_proxy_is_unavailable() {
        let factory = DefaultConnectorFactory::new(None);
        let mut connector = factory.create(&ConnectionConfig::host_managed());
        let result = connector.connect(&ConnectionConfig::host_managed()).await;
        assert!(matches!(result, Err(ConnectError::UpstreamUnavailable(_))));
        assert_eq!(connector.state(), ConnectionState::Error);
    }
}
