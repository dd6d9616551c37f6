//! Scripted bus connector for driving the bridge without a broker.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use watts_bridge::mqtt::config::{ConnectionConfig, TransportKind};
use watts_bridge::mqtt::connector::{next_epoch, BusConnector, ConnectionState, ConnectorFactory, Ready};
use watts_bridge::mqtt::error::{ConnectError, PublishError};
use watts_bridge::mqtt::host::{HostBrokerProxy, ProxyError, ProxyEvent, SharedHostBroker};
use watts_bridge::mqtt::message::BusMessage;
use watts_bridge::mqtt::DefaultConnectorFactory;

#[derive(Default)]
pub struct FakeBusState {
    /// Connectors handed out by the factory
    pub created: usize,
    /// Connectors currently holding a session
    pub live: usize,
    pub connect_attempts: usize,
    pub fail_connects: bool,
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub configs: Vec<ConnectionConfig>,
    session: Option<(u64, mpsc::Sender<BusMessage>)>,
}

/// Shared view of every connector the factory created.
#[derive(Clone, Default)]
pub struct FakeBus {
    state: Arc<Mutex<FakeBusState>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeBusState> {
        self.state.lock().unwrap()
    }

    pub fn factory(&self) -> Arc<dyn ConnectorFactory> {
        Arc::new(FakeFactory { bus: self.clone() })
    }

    pub fn set_failing(&self, failing: bool) {
        self.state().fail_connects = failing;
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.state().session.as_ref().map(|(epoch, _)| *epoch)
    }

    /// Publishes `payload` on `topic` through the live session.
    pub async fn emit(&self, topic: &str, payload: &str) {
        let epoch = self.current_epoch().expect("no live session");
        self.emit_tagged(topic, payload, epoch).await;
    }

    /// Like `emit`, but with an explicit session epoch.
    pub async fn emit_tagged(&self, topic: &str, payload: &str, epoch: u64) {
        let tx = self
            .state()
            .session
            .as_ref()
            .map(|(_, tx)| tx.clone())
            .expect("no live session");
        tx.send(BusMessage::new(topic, payload, epoch)).await.unwrap();
    }

    /// Ends the live session as if the broker dropped the connection.
    pub fn drop_session(&self) {
        self.state().session = None;
    }
}

struct FakeFactory {
    bus: FakeBus,
}

impl ConnectorFactory for FakeFactory {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn BusConnector> {
        self.bus.state().created += 1;
        Box::new(FakeConnector {
            bus: self.bus.clone(),
            kind: config.transport,
            state: ConnectionState::Disconnected,
            epoch: None,
        })
    }
}

struct FakeConnector {
    bus: FakeBus,
    kind: TransportKind,
    state: ConnectionState,
    epoch: Option<u64>,
}

impl FakeConnector {
    fn release(&mut self) {
        if let Some(epoch) = self.epoch.take() {
            let mut state = self.bus.state();
            state.live -= 1;
            if state.session.as_ref().is_some_and(|(live, _)| *live == epoch) {
                state.session = None;
            }
        }
    }
}

#[async_trait]
impl BusConnector for FakeConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> Result<Ready, ConnectError> {
        self.release();
        let mut state = self.bus.state();
        state.connect_attempts += 1;
        state.configs.push(config.clone());
        if state.fail_connects {
            self.state = ConnectionState::Error;
            return Err(ConnectError::Transport("connection refused".to_string()));
        }

        let epoch = next_epoch();
        let (tx, inbound) = mpsc::channel(64);
        state.session = Some((epoch, tx));
        state.live += 1;
        self.epoch = Some(epoch);
        self.state = ConnectionState::Connected;
        Ok(Ready::new(inbound, epoch))
    }

    async fn disconnect(&mut self) {
        self.release();
        self.state = ConnectionState::Disconnected;
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        if self.state != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        self.bus.state().subscribed.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        if self.state != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        self.bus.state().unsubscribed.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if self.state != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        self.bus
            .state()
            .published
            .push((topic.to_string(), payload));
        Ok(())
    }
}

impl Drop for FakeConnector {
    fn drop(&mut self) {
        self.release();
    }
}

/// In-memory host broker proxy whose install state the test flips.
pub struct FakeHostProxy {
    installed: AtomicBool,
    events: broadcast::Sender<ProxyEvent>,
    calls: Mutex<Vec<String>>,
}

impl FakeHostProxy {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            installed: AtomicBool::new(true),
            events,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Host-managed connectors sharing this proxy.
    pub fn factory(self: &Arc<Self>) -> Arc<dyn ConnectorFactory> {
        let host = SharedHostBroker::new(self.clone());
        Arc::new(DefaultConnectorFactory::new(Some(host)))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn uninstall(&self) {
        self.installed.store(false, Ordering::SeqCst);
        let _ = self.events.send(ProxyEvent::Uninstalled);
    }

    pub fn install(&self) {
        self.installed.store(true, Ordering::SeqCst);
        let _ = self.events.send(ProxyEvent::Installed);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl HostBrokerProxy for FakeHostProxy {
    async fn is_installed(&self) -> Result<bool, ProxyError> {
        Ok(self.installed.load(Ordering::SeqCst))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ProxyError> {
        self.record(format!("sub {}", topic));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProxyError> {
        self.record(format!("unsub {}", topic));
        Ok(())
    }

    async fn publish(&self, topic: &str, _payload: Vec<u8>) -> Result<(), ProxyError> {
        self.record(format!("pub {}", topic));
        Ok(())
    }

    fn realtime(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    async fn release(&self) {
        self.record("release".to_string());
    }
}
