//! # Bridge
//!
//! One coordinator task per driver instance. It owns the live connector, the
//! router, the liveness record and the running discovery session, and is the
//! only place any of them is mutated.
//!
//! ```text
//!                 ┌──────────── BridgeHandle (commands) ────────────┐
//!                 ▼                                                 │
//! connector ─► inbound ─► Bridge ─┬─► Router ─► device sinks        │
//!                 ▲               │        └─► discovery collector  │
//!                 │               └─► Liveness ◄── health tick      │
//!                 └──────── reconnect (teardown, create, connect) ──┘
//! ```
//!
//! Every connect yields a fresh inbound receiver tagged with a session epoch.
//! Teardown drops the receiver before the old connector is disconnected, and
//! messages carrying any other epoch are discarded, so a torn-down session can
//! never reach the router.
//!
//! A lost session is retried by the health tick, unless the connector reports
//! its upstream back first (a host proxy install); then it reconnects at once.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{DiscoveryCoordinator, DiscoveryHandle, DiscoveryOutcome, DiscoverySettings};
use crate::health::{HealthMonitor, HealthSettings, HealthVerdict, Liveness};
use crate::mqtt::config::{ConnectionConfig, TransportKind};
use crate::mqtt::connector::{BusConnector, ConnectionState, ConnectorFactory};
use crate::mqtt::error::{ConnectError, PublishError};
use crate::mqtt::message::BusMessage;
use crate::routing::router::{MessageSink, Router};

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The bridge task has stopped
    #[error("Bridge is not running")]
    Stopped,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Snapshot published on every state change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BridgeStatus {
    pub connection_state: ConnectionState,
    /// Whether devices behind this bridge should be shown as available
    pub available: bool,
    pub transport: TransportKind,
    pub epoch: Option<u64>,
    pub reconnects: u64,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
    pub last_error: Option<String>,
    pub discovering: bool,
}

/// Everything the bridge needs to run.
#[derive(Clone, Debug, Default)]
pub struct BridgeOptions {
    pub connection: ConnectionConfig,
    pub health: HealthSettings,
    pub discovery: DiscoverySettings,
}

#[derive(Debug)]
enum BridgeCommand {
    Connect {
        response_tx: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    RegisterTopic {
        topic: String,
        sink: MessageSink,
        response_tx: oneshot::Sender<Result<(), PublishError>>,
    },
    UnregisterTopic {
        topic: String,
        response_tx: oneshot::Sender<bool>,
    },
    StartDiscovery {
        ignore: BTreeSet<String>,
        response_tx: oneshot::Sender<DiscoveryOutcome>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        response_tx: oneshot::Sender<Result<(), PublishError>>,
    },
    UpdateConfig {
        config: ConnectionConfig,
        response_tx: oneshot::Sender<Result<bool, ConnectError>>,
    },
    CheckLiveness {
        response_tx: oneshot::Sender<bool>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

macro_rules! respond {
    ($response_tx:expr, $value:expr) => {
        if $response_tx.send($value).is_err() {
            debug!("Bridge caller went away before the response");
        }
    };
}

/// Cheap, cloneable access to a running bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeCommand>,
    status: watch::Receiver<BridgeStatus>,
}

impl BridgeHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> BridgeCommand,
    ) -> Result<T, BridgeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| BridgeError::Stopped)?;
        response_rx.await.map_err(|_| BridgeError::Stopped)
    }

    /// (Re)connects with the current config. A failure is also picked up by
    /// the next health tick, which retries.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        Ok(self
            .request(|response_tx| BridgeCommand::Connect { response_tx })
            .await??)
    }

    /// Tears the connector down without scheduling a reconnect.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.request(|response_tx| BridgeCommand::Disconnect { response_tx })
            .await
    }

    /// Routes `topic` to `sink` and subscribes it on the bus. Registering a
    /// topic again replaces its handler.
    pub async fn register_topic(
        &self,
        topic: impl Into<String>,
        sink: MessageSink,
    ) -> Result<(), BridgeError> {
        let topic = topic.into();
        Ok(self
            .request(|response_tx| BridgeCommand::RegisterTopic {
                topic,
                sink,
                response_tx,
            })
            .await??)
    }

    /// Returns false when nothing was registered for `topic`.
    pub async fn unregister_topic(&self, topic: impl Into<String>) -> Result<bool, BridgeError> {
        let topic = topic.into();
        self.request(|response_tx| BridgeCommand::UnregisterTopic { topic, response_tx })
            .await
    }

    /// Starts a discovery session, replacing any running one. Topics already
    /// claimed by registered devices are ignored in addition to `ignore`.
    pub async fn start_discovery(
        &self,
        ignore: BTreeSet<String>,
    ) -> Result<DiscoveryOutcome, BridgeError> {
        self.request(|response_tx| BridgeCommand::StartDiscovery {
            ignore,
            response_tx,
        })
        .await
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), BridgeError> {
        let topic = topic.into();
        let payload = payload.into();
        Ok(self
            .request(|response_tx| BridgeCommand::Publish {
                topic,
                payload,
                response_tx,
            })
            .await??)
    }

    /// Applies a new connection config. Returns true when the change touched
    /// the transport and the connector was rebuilt.
    pub async fn update_config(&self, config: ConnectionConfig) -> Result<bool, BridgeError> {
        Ok(self
            .request(|response_tx| BridgeCommand::UpdateConfig {
                config,
                response_tx,
            })
            .await??)
    }

    /// True while connected and traffic arrived within the staleness window.
    pub async fn check_liveness(&self) -> Result<bool, BridgeError> {
        self.request(|response_tx| BridgeCommand::CheckLiveness { response_tx })
            .await
    }

    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.request(|response_tx| BridgeCommand::Shutdown { response_tx })
            .await
    }

    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }
}

pub struct Bridge {
    config: ConnectionConfig,
    factory: Arc<dyn ConnectorFactory>,
    connector: Option<Box<dyn BusConnector>>,
    inbound: Option<mpsc::Receiver<BusMessage>>,
    epoch: Option<u64>,
    recovery: Option<oneshot::Receiver<()>>,
    router: Router,
    liveness: Liveness,
    monitor: HealthMonitor,
    coordinator: DiscoveryCoordinator,
    discovery: Option<DiscoveryHandle>,
    status: watch::Sender<BridgeStatus>,
    commands: mpsc::Receiver<BridgeCommand>,
    cancel: CancellationToken,
}

impl Bridge {
    /// Spawns the bridge task. Nothing connects until [`BridgeHandle::connect`].
    pub fn spawn(
        options: BridgeOptions,
        factory: Arc<dyn ConnectorFactory>,
        cancel: CancellationToken,
    ) -> (BridgeHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (status, status_rx) = watch::channel(BridgeStatus {
            transport: options.connection.transport,
            ..BridgeStatus::default()
        });

        let bridge = Bridge {
            config: options.connection,
            factory,
            connector: None,
            inbound: None,
            epoch: None,
            recovery: None,
            router: Router::new(),
            liveness: Liveness::default(),
            monitor: HealthMonitor::new(options.health),
            coordinator: DiscoveryCoordinator::new(options.discovery),
            discovery: None,
            status,
            commands,
            cancel,
        };

        let task = tokio::spawn(bridge.run());
        (
            BridgeHandle {
                tx,
                status: status_rx,
            },
            task,
        )
    }

    async fn run(mut self) {
        let period = self.monitor.settings().check_interval();
        let mut health = interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Bridge running, health check every {:?}", period);

        let mut shutdown_tx = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(BridgeCommand::Shutdown { response_tx }) => {
                        shutdown_tx = Some(response_tx);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("All bridge handles dropped");
                        break;
                    }
                },
                msg = recv_inbound(&mut self.inbound) => match msg {
                    Some(msg) => self.on_message(msg),
                    None => self.on_session_closed(),
                },
                recovered = upstream_recovered(&mut self.recovery) => {
                    self.recovery = None;
                    if recovered {
                        self.on_upstream_recovered().await;
                    }
                }
                _ = discovery_finished(&self.discovery) => self.end_discovery().await,
                _ = health.tick() => self.on_health_tick().await,
            }
        }

        if let Some(discovery) = self.discovery.take() {
            discovery.abandon();
        }
        self.teardown().await;
        self.status.send_modify(|status| {
            status.connection_state = ConnectionState::Disconnected;
            status.available = false;
            status.discovering = false;
        });
        info!("Bridge stopped");
        if let Some(response_tx) = shutdown_tx {
            respond!(response_tx, ());
        }
    }

    async fn handle_command(&mut self, cmd: BridgeCommand) {
        match cmd {
            BridgeCommand::Connect { response_tx } => {
                respond!(response_tx, self.connect().await);
            }
            BridgeCommand::Disconnect { response_tx } => {
                info!("Disconnect requested");
                self.teardown().await;
                // Back to idle: the health tick leaves an explicit disconnect alone
                self.liveness = Liveness::default();
                self.status.send_modify(|status| {
                    status.connection_state = ConnectionState::Disconnected;
                    status.available = false;
                });
                respond!(response_tx, ());
            }
            BridgeCommand::RegisterTopic {
                topic,
                sink,
                response_tx,
            } => {
                respond!(response_tx, self.register_topic(topic, sink).await);
            }
            BridgeCommand::UnregisterTopic { topic, response_tx } => {
                respond!(response_tx, self.unregister_topic(&topic).await);
            }
            BridgeCommand::StartDiscovery {
                ignore,
                response_tx,
            } => {
                respond!(response_tx, self.start_discovery(ignore).await);
            }
            BridgeCommand::Publish {
                topic,
                payload,
                response_tx,
            } => {
                respond!(response_tx, self.publish(&topic, payload).await);
            }
            BridgeCommand::UpdateConfig {
                config,
                response_tx,
            } => {
                respond!(response_tx, self.update_config(config).await);
            }
            BridgeCommand::CheckLiveness { response_tx } => {
                let connected = self
                    .connector
                    .as_ref()
                    .is_some_and(|c| c.state() == ConnectionState::Connected);
                let fresh = self
                    .liveness
                    .is_fresh(Instant::now(), self.monitor.settings().stale_after());
                respond!(response_tx, connected && fresh);
            }
            // Handled by the run loop
            BridgeCommand::Shutdown { response_tx } => respond!(response_tx, ()),
        }
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.teardown().await;

        let mut connector = self.factory.create(&self.config);
        self.status.send_modify(|status| {
            status.connection_state = ConnectionState::Connecting;
            status.transport = connector.kind();
        });

        match connector.connect(&self.config).await {
            Ok(ready) => {
                info!(
                    "Connected via {:?} to {} (session {})",
                    connector.kind(),
                    self.config.endpoint(),
                    ready.epoch
                );
                // A host-managed install is confirmation enough; a direct
                // connection waits for its first message
                let available = connector.kind() == TransportKind::HostManaged;
                self.inbound = Some(ready.inbound);
                self.epoch = Some(ready.epoch);
                self.recovery = ready.recovered;
                self.connector = Some(connector);
                self.resubscribe().await;
                self.liveness.observe(Instant::now());
                self.status.send_modify(|status| {
                    status.connection_state = ConnectionState::Connected;
                    status.available = available;
                    status.epoch = Some(ready.epoch);
                    status.last_error = None;
                });
                Ok(())
            }
            Err(e) => {
                error!("Connect via {:?} failed: {}", connector.kind(), e);
                self.recovery = connector.take_recovery();
                self.liveness.reset_after_attempt();
                self.status.send_modify(|status| {
                    status.connection_state = ConnectionState::Error;
                    status.available = false;
                    status.epoch = None;
                    status.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    /// Stops dispatch from the current session, then disconnects and drops
    /// its connector.
    async fn teardown(&mut self) {
        self.inbound = None;
        self.epoch = None;
        self.recovery = None;
        if let Some(mut connector) = self.connector.take() {
            debug!("Tearing down {:?} connector", connector.kind());
            connector.disconnect().await;
        }
    }

    async fn resubscribe(&mut self) {
        let mut topics = self.router.topics();
        if let Some(discovery) = &self.discovery {
            let pattern = discovery.pattern().to_string();
            if !topics.contains(&pattern) {
                topics.push(pattern);
            }
        }
        let Some(connector) = self.connector.as_mut() else {
            return;
        };
        for topic in topics {
            if let Err(e) = connector.subscribe(&topic).await {
                warn!("Can not subscribe to topic {}: {}", topic, e);
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        match self.connector.as_mut() {
            Some(connector) => match connector.subscribe(topic).await {
                Ok(()) => {
                    info!("Subscribed to {}", topic);
                    Ok(())
                }
                // Picked up by the resubscribe after the next connect
                Err(PublishError::NotConnected) => Ok(()),
                Err(e) => {
                    warn!("Can not subscribe to topic {}: {}", topic, e);
                    Err(e)
                }
            },
            None => {
                debug!("Not connected, {} subscribes on connect", topic);
                Ok(())
            }
        }
    }

    async fn unsubscribe(&mut self, topic: &str) {
        if let Some(connector) = self.connector.as_mut() {
            if let Err(e) = connector.unsubscribe(topic).await {
                debug!("Unsubscribe of {} skipped: {}", topic, e);
            }
        }
    }

    async fn register_topic(&mut self, topic: String, sink: MessageSink) -> Result<(), PublishError> {
        if self.router.register(&topic, sink) {
            info!("Replaced handler for {}", topic);
        } else {
            info!("Registered handler for {}", topic);
        }
        self.subscribe(&topic).await
    }

    async fn unregister_topic(&mut self, topic: &str) -> bool {
        if !self.router.unregister(topic) {
            debug!("Nothing registered for {}", topic);
            return false;
        }
        let discovery_needs_it = self
            .discovery
            .as_ref()
            .is_some_and(|d| d.pattern().as_str() == topic);
        if !discovery_needs_it {
            self.unsubscribe(topic).await;
        }
        info!("Unregistered handler for {}", topic);
        true
    }

    async fn start_discovery(&mut self, ignore: BTreeSet<String>) -> DiscoveryOutcome {
        if let Some(previous) = self.discovery.take() {
            info!("Abandoning running discovery session for a new one");
            previous.abandon();
        }

        let mut ignore = ignore;
        ignore.extend(self.router.claimed_topics());
        let run = self.coordinator.start(ignore);
        let pattern = run.handle.pattern().clone();

        self.router.attach_collector(pattern.clone(), run.collector);
        self.discovery = Some(run.handle);
        if !self.router.is_registered(pattern.as_str()) {
            if let Err(e) = self.subscribe(pattern.as_str()).await {
                warn!("Discovery continues without a subscription: {}", e);
            }
        }
        self.status.send_modify(|status| status.discovering = true);
        run.outcome
    }

    async fn end_discovery(&mut self) {
        let Some(discovery) = self.discovery.take() else {
            return;
        };
        self.router.detach_collector();
        let pattern = discovery.pattern().as_str();
        if !self.router.is_registered(pattern) {
            self.unsubscribe(pattern).await;
        }
        debug!("Discovery session closed");
        self.status.send_modify(|status| status.discovering = false);
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let connector = self.connector.as_mut().ok_or(PublishError::NotConnected)?;
        connector.publish(topic, payload).await?;
        self.status.send_modify(|status| status.messages_sent += 1);
        Ok(())
    }

    async fn update_config(&mut self, config: ConnectionConfig) -> Result<bool, ConnectError> {
        let rebuild = self.config.requires_reconnect(&config);
        self.config = config;
        if !rebuild {
            debug!("Config change does not touch the transport");
            return Ok(false);
        }
        info!("Transport settings changed, reconnecting to {}", self.config.endpoint());
        self.status.send_modify(|status| status.reconnects += 1);
        self.connect().await.map(|()| true)
    }

    fn on_message(&mut self, msg: BusMessage) {
        if self.epoch != Some(msg.epoch) {
            debug!("Dropping {} from ended session {}", msg.topic, msg.epoch);
            return;
        }
        self.liveness.observe(Instant::now());
        let received_at = msg.received_at;
        let dispatch = self.router.dispatch(msg);
        if !dispatch.delivered && !dispatch.collected {
            debug!("Message had no taker");
        }
        self.status.send_modify(|status| {
            status.messages_received += 1;
            status.last_activity = Some(received_at);
            status.available = true;
        });
    }

    fn on_session_closed(&mut self) {
        warn!("Bus session {:?} ended", self.epoch);
        self.inbound = None;
        self.epoch = None;
        self.liveness.reset_after_attempt();
        self.status.send_modify(|status| {
            status.connection_state = ConnectionState::Error;
            status.available = false;
        });
    }

    async fn on_upstream_recovered(&mut self) {
        info!("Upstream is back, reconnecting without waiting for the health check");
        self.status.send_modify(|status| status.reconnects += 1);
        if let Err(e) = self.connect().await {
            debug!("Reconnect after recovery failed, next tick retries: {}", e);
        }
    }

    /// At most one reconnect attempt per tick.
    async fn on_health_tick(&mut self) {
        match self.monitor.evaluate(&self.liveness, Instant::now()) {
            HealthVerdict::Healthy | HealthVerdict::Idle => {}
            HealthVerdict::StaleConnection { silent_for } => {
                match silent_for {
                    Some(silent) => warn!("No message for {:?}, connection is stale", silent),
                    None => warn!("No traffic since the last connect attempt"),
                }
                self.status.send_modify(|status| {
                    status.connection_state = ConnectionState::Stale;
                    status.available = false;
                    status.reconnects += 1;
                });
                if let Err(e) = self.connect().await {
                    debug!("Reconnect failed, next tick retries: {}", e);
                }
            }
        }
    }
}

async fn recv_inbound(inbound: &mut Option<mpsc::Receiver<BusMessage>>) -> Option<BusMessage> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// True once the upstream reports back, false if the signal can no longer come.
async fn upstream_recovered(recovery: &mut Option<oneshot::Receiver<()>>) -> bool {
    match recovery {
        Some(rx) => rx.await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn discovery_finished(discovery: &Option<DiscoveryHandle>) {
    match discovery {
        Some(handle) => handle.finished().await,
        None => std::future::pending().await,
    }
}
