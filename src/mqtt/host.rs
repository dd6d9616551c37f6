//! Host-managed transport
//!
//! The host platform exposes one broker proxy per process. Every connector that
//! selects the host-managed transport leases the same [`SharedHostBroker`];
//! topic subscriptions are reference counted across leases so one device
//! unsubscribing never silences another, and the proxy is only released when
//! the last lease goes away.
//!
//! The proxy delivers all traffic on one realtime stream regardless of who
//! subscribed, so each connector filters by its own topics. When the proxy is
//! uninstalled the session ends, and the connector keeps watching the stream
//! so the next install can be reported through [`Ready::recovered`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectionConfig, TransportKind};
use super::connector::{next_epoch, BusConnector, ConnectionState, Ready, INBOUND_CAPACITY};
use super::error::{ConnectError, PublishError};
use super::message::BusMessage;
use crate::routing::topic::TopicPattern;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Broker proxy is not installed")]
    NotInstalled,

    #[error("Broker proxy request failed: {0}")]
    Request(String),
}

/// What the proxy's realtime stream carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    Message { topic: String, payload: Vec<u8> },
    Installed,
    Uninstalled,
}

/// The host platform's broker proxy capability.
#[async_trait]
pub trait HostBrokerProxy: Send + Sync {
    async fn is_installed(&self) -> Result<bool, ProxyError>;

    async fn subscribe(&self, topic: &str) -> Result<(), ProxyError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProxyError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProxyError>;

    /// A new receiver on the shared realtime stream.
    fn realtime(&self) -> broadcast::Receiver<ProxyEvent>;

    /// Called once the last lease is gone.
    async fn release(&self) {}
}

#[derive(Default, Debug)]
struct LeaseBook {
    users: usize,
    topics: HashMap<String, usize>,
}

struct HostBrokerInner {
    proxy: Arc<dyn HostBrokerProxy>,
    book: Mutex<LeaseBook>,
}

/// Process-wide handle on the host broker proxy. Cheap to clone.
#[derive(Clone)]
pub struct SharedHostBroker {
    inner: Arc<HostBrokerInner>,
}

impl SharedHostBroker {
    pub fn new(proxy: Arc<dyn HostBrokerProxy>) -> Self {
        Self {
            inner: Arc::new(HostBrokerInner {
                proxy,
                book: Mutex::new(LeaseBook::default()),
            }),
        }
    }

    /// Registers one more user, provided the proxy reports itself installed.
    pub async fn acquire(&self) -> Result<HostLease, ConnectError> {
        match self.inner.proxy.is_installed().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(ConnectError::UpstreamUnavailable(
                    ProxyError::NotInstalled.to_string(),
                ))
            }
            Err(e) => return Err(ConnectError::UpstreamUnavailable(e.to_string())),
        }

        let users = {
            let mut book = lock_book(&self.inner.book);
            book.users += 1;
            book.users
        };
        debug!("Host broker lease acquired, {} active", users);

        Ok(HostLease {
            broker: self.clone(),
            topics: BTreeSet::new(),
            released: false,
        })
    }

    pub fn realtime(&self) -> broadcast::Receiver<ProxyEvent> {
        self.inner.proxy.realtime()
    }

    pub fn active_users(&self) -> usize {
        lock_book(&self.inner.book).users
    }

    /// How many leases currently hold `topic`.
    pub fn topic_holders(&self, topic: &str) -> usize {
        lock_book(&self.inner.book)
            .topics
            .get(topic)
            .copied()
            .unwrap_or(0)
    }
}

fn lock_book(book: &Mutex<LeaseBook>) -> std::sync::MutexGuard<'_, LeaseBook> {
    // Counters stay consistent even if a holder panicked
    book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One connector's share of the host broker.
pub struct HostLease {
    broker: SharedHostBroker,
    topics: BTreeSet<String>,
    released: bool,
}

impl HostLease {
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        if self.topics.contains(topic) {
            return Ok(());
        }
        let first = {
            let mut book = lock_book(&self.broker.inner.book);
            let holders = book.topics.entry(topic.to_string()).or_insert(0);
            *holders += 1;
            *holders == 1
        };
        self.topics.insert(topic.to_string());

        if first {
            if let Err(e) = self.broker.inner.proxy.subscribe(topic).await {
                warn!("Can not subscribe to topic {}: {}", topic, e);
                self.forget(topic);
                return Err(PublishError::Rejected(e.to_string()));
            }
            info!("Successfully subscribed to topic: {}", topic);
        }
        Ok(())
    }

    pub async fn unsubscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        if !self.topics.contains(topic) {
            return Ok(());
        }
        if self.forget(topic) {
            self.broker
                .inner
                .proxy
                .unsubscribe(topic)
                .await
                .map_err(|e| PublishError::Rejected(e.to_string()))?;
            debug!("Last holder left, unsubscribed {}", topic);
        }
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        debug!("sendMessage: {} ({} bytes)", topic, payload.len());
        self.broker
            .inner
            .proxy
            .publish(topic, payload)
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))
    }

    /// Drops this lease's topics and, for the last user, releases the proxy.
    pub async fn release(mut self) {
        let topics: Vec<String> = self.topics.iter().cloned().collect();
        for topic in topics {
            if self.forget(&topic) {
                if let Err(e) = self.broker.inner.proxy.unsubscribe(&topic).await {
                    warn!("Unsubscribe of {} during release failed: {}", topic, e);
                }
            }
        }

        let remaining = self.leave();
        if remaining == 0 {
            info!("Last host broker user left, releasing proxy");
            self.broker.inner.proxy.release().await;
        }
    }

    /// Removes one hold on `topic`. True when nobody holds it anymore.
    fn forget(&mut self, topic: &str) -> bool {
        if !self.topics.remove(topic) {
            return false;
        }
        let mut book = lock_book(&self.broker.inner.book);
        match book.topics.get_mut(topic) {
            Some(holders) if *holders > 1 => {
                *holders -= 1;
                false
            }
            Some(_) => {
                book.topics.remove(topic);
                true
            }
            None => false,
        }
    }

    fn leave(&mut self) -> usize {
        if self.released {
            return lock_book(&self.broker.inner.book).users;
        }
        self.released = true;
        let mut book = lock_book(&self.broker.inner.book);
        book.users = book.users.saturating_sub(1);
        book.users
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Unreleased lease: keep the books right, the proxy keeps its subscriptions
        let topics: Vec<String> = self.topics.iter().cloned().collect();
        for topic in topics {
            self.forget(&topic);
        }
        self.leave();
    }
}

struct HostSession {
    lease: HostLease,
    filter: Arc<RwLock<Vec<TopicPattern>>>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    state: watch::Receiver<ConnectionState>,
    epoch: u64,
}

pub struct HostManagedConnector {
    host: Option<SharedHostBroker>,
    state: ConnectionState,
    session: Option<HostSession>,
    recovery: Option<oneshot::Receiver<()>>,
}

impl HostManagedConnector {
    pub fn new(host: Option<SharedHostBroker>) -> Self {
        Self {
            host,
            state: ConnectionState::Disconnected,
            session: None,
            recovery: None,
        }
    }

    fn live_session(&mut self) -> Result<&mut HostSession, PublishError> {
        match self.session.as_mut() {
            Some(session) if *session.state.borrow() == ConnectionState::Connected => Ok(session),
            _ => Err(PublishError::NotConnected),
        }
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Tearing down host-managed session {}", session.epoch);
            session.cancel.cancel();
            if let Err(e) = session.pump.await {
                warn!("Realtime pump ended abnormally: {}", e);
            }
            session.lease.release().await;
        }
    }
}

#[async_trait]
impl BusConnector for HostManagedConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::HostManaged
    }

    fn state(&self) -> ConnectionState {
        match &self.session {
            Some(session) => *session.state.borrow(),
            None => self.state,
        }
    }

    async fn connect(&mut self, _config: &ConnectionConfig) -> Result<Ready, ConnectError> {
        self.teardown().await;
        self.state = ConnectionState::Connecting;
        self.recovery = None;

        let Some(host) = self.host.clone() else {
            self.state = ConnectionState::Error;
            return Err(ConnectError::UpstreamUnavailable(
                "no host broker proxy registered".to_string(),
            ));
        };

        // Subscribe to the stream before the lease so nothing published in between is lost
        let realtime = host.realtime();
        let lease = match host.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                error!("MQTT client app error: {}", e);
                self.state = ConnectionState::Error;
                let (recovered_tx, recovered_rx) = oneshot::channel();
                tokio::spawn(report_install(realtime, recovered_tx, CancellationToken::new()));
                self.recovery = Some(recovered_rx);
                return Err(e);
            }
        };

        let epoch = next_epoch();
        let filter = Arc::new(RwLock::new(Vec::new()));
        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (recovered_tx, recovered_rx) = oneshot::channel();

        let pump = tokio::spawn(run_realtime_pump(
            realtime,
            filter.clone(),
            inbound_tx,
            state_tx,
            recovered_tx,
            cancel.clone(),
            epoch,
        ));

        info!("MQTT client status: installed (session {})", epoch);
        self.session = Some(HostSession {
            lease,
            filter,
            cancel,
            pump,
            state: state_rx,
            epoch,
        });
        self.state = ConnectionState::Connected;
        Ok(Ready::new(inbound_rx, epoch).with_recovery(recovered_rx))
    }

    async fn disconnect(&mut self) {
        self.teardown().await;
        self.state = ConnectionState::Disconnected;
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        let session = self.live_session()?;
        session.lease.subscribe(topic).await?;
        let mut filter = session
            .filter
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let pattern = TopicPattern::new(topic);
        if !filter.contains(&pattern) {
            filter.push(pattern);
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        let session = self.live_session()?;
        {
            let mut filter = session
                .filter
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            filter.retain(|pattern| pattern.as_str() != topic);
        }
        session.lease.unsubscribe(topic).await
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let session = self.live_session()?;
        session.lease.publish(topic, payload).await
    }

    fn take_recovery(&mut self) -> Option<oneshot::Receiver<()>> {
        self.recovery.take()
    }
}

/// How the forwarding part of a realtime pump ended.
enum SessionEnd {
    Cancelled,
    Lost,
}

async fn run_realtime_pump(
    mut realtime: broadcast::Receiver<ProxyEvent>,
    filter: Arc<RwLock<Vec<TopicPattern>>>,
    inbound: mpsc::Sender<BusMessage>,
    state: watch::Sender<ConnectionState>,
    recovered: oneshot::Sender<()>,
    cancel: CancellationToken,
    epoch: u64,
) {
    let end = forward_session(&mut realtime, &filter, &inbound, &cancel, epoch).await;
    if let SessionEnd::Lost = end {
        state.send_replace(ConnectionState::Error);
        // Closing inbound ends the session for the bridge
        drop(inbound);
        report_install(realtime, recovered, cancel).await;
    }
    debug!("Realtime pump {} stopped", epoch);
}

async fn forward_session(
    realtime: &mut broadcast::Receiver<ProxyEvent>,
    filter: &RwLock<Vec<TopicPattern>>,
    inbound: &mpsc::Sender<BusMessage>,
    cancel: &CancellationToken,
    epoch: u64,
) -> SessionEnd {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            event = realtime.recv() => event,
        };

        match event {
            Ok(ProxyEvent::Message { topic, payload }) => {
                let wanted = filter
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .iter()
                    .any(|pattern| pattern.matches(&topic));
                if !wanted {
                    continue;
                }
                let msg = BusMessage::new(topic, payload, epoch);
                tokio::select! {
                    _ = cancel.cancelled() => return SessionEnd::Cancelled,
                    sent = inbound.send(msg) => {
                        if sent.is_err() {
                            debug!("Inbound receiver dropped, stopping pump {}", epoch);
                            return SessionEnd::Cancelled;
                        }
                    }
                }
            }
            Ok(ProxyEvent::Installed) => debug!("Broker proxy (re)installed"),
            Ok(ProxyEvent::Uninstalled) => {
                warn!("Broker proxy uninstalled, session {} lost", epoch);
                return SessionEnd::Lost;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Realtime stream lagged, {} messages skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Realtime stream closed, session {} lost", epoch);
                return SessionEnd::Lost;
            }
        }
    }
}

/// Fires `recovered` on the next install, unless cancelled or nobody listens.
async fn report_install(
    mut realtime: broadcast::Receiver<ProxyEvent>,
    mut recovered: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    let installed = tokio::select! {
        _ = cancel.cancelled() => false,
        _ = recovered.closed() => false,
        installed = next_install(&mut realtime) => installed,
    };
    if installed {
        info!("Broker proxy installed again");
        if recovered.send(()).is_err() {
            debug!("Nobody waits for the proxy to return");
        }
    }
}

/// False when the stream closed first.
async fn next_install(realtime: &mut broadcast::Receiver<ProxyEvent>) -> bool {
    loop {
        match realtime.recv().await {
            Ok(ProxyEvent::Installed) => return true,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}
