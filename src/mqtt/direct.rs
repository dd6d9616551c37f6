//! Directly owned broker connection backed by rumqttc
//!
//! Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair and spawns a
//! pump task that polls the event loop. The pump forwards every publish into
//! the session's inbound channel and ends on the first connection error; it
//! never lets rumqttc reconnect behind the health monitor's back. Teardown
//! queues a DISCONNECT and lets the pump flush it before cancelling.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectionConfig, TransportKind};
use super::connector::{next_epoch, BusConnector, ConnectionState, Ready, INBOUND_CAPACITY};
use super::error::{ConnectError, PublishError};
use super::message::BusMessage;
use super::tls;

const REQUEST_CAPACITY: usize = 64;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

struct DirectSession {
    client: AsyncClient,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    state: watch::Receiver<ConnectionState>,
    epoch: u64,
}

#[derive(Default)]
pub struct DirectConnector {
    state: ConnectionState,
    session: Option<DirectSession>,
}

impl DirectConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_client(&self) -> Result<&AsyncClient, PublishError> {
        match &self.session {
            Some(session) if *session.state.borrow() == ConnectionState::Connected => {
                Ok(&session.client)
            }
            _ => Err(PublishError::NotConnected),
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!("Tearing down direct session {}", session.epoch);
            let flushed = match session.client.try_disconnect() {
                Ok(()) => tokio::time::timeout(DISCONNECT_GRACE, &mut session.pump)
                    .await
                    .ok(),
                Err(e) => {
                    debug!("Disconnect request not queued: {}", e);
                    None
                }
            };
            let joined = match flushed {
                Some(joined) => joined,
                None => {
                    session.cancel.cancel();
                    session.pump.await
                }
            };
            if let Err(e) = joined {
                warn!("Receive pump ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait]
impl BusConnector for DirectConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn state(&self) -> ConnectionState {
        match &self.session {
            Some(session) => *session.state.borrow(),
            None => self.state,
        }
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> Result<Ready, ConnectError> {
        self.teardown().await;
        self.state = ConnectionState::Connecting;

        let options = match tls::mqtt_options(config) {
            Ok(options) => options,
            Err(e) => {
                self.state = ConnectionState::Error;
                return Err(e);
            }
        };

        info!("Connecting to broker at {}", config.endpoint());
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let epoch = next_epoch();

        let pump = tokio::spawn(run_pump(
            eventloop,
            inbound_tx,
            ready_tx,
            state_tx,
            cancel.clone(),
            epoch,
        ));

        let outcome = match tokio::time::timeout(config.connect_timeout(), ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectError::Transport(
                "receive pump ended before the broker answered".to_string(),
            )),
            Err(_) => Err(ConnectError::Transport(format!(
                "no answer from {} within {:?}",
                config.endpoint(),
                config.connect_timeout()
            ))),
        };

        match outcome {
            Ok(()) => {
                info!("Connected to {} (session {})", config.endpoint(), epoch);
                self.session = Some(DirectSession {
                    client,
                    cancel,
                    pump,
                    state: state_rx,
                    epoch,
                });
                self.state = ConnectionState::Connected;
                Ok(Ready::new(inbound_rx, epoch))
            }
            Err(e) => {
                error!("Connection to {} failed: {}", config.endpoint(), e);
                cancel.cancel();
                if let Err(join) = pump.await {
                    warn!("Receive pump ended abnormally: {}", join);
                }
                self.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.teardown().await;
        self.state = ConnectionState::Disconnected;
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        let client = self.live_client()?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        debug!("Subscribed to {}", topic);
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), PublishError> {
        let client = self.live_client()?;
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        debug!("Unsubscribed from {}", topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let client = self.live_client()?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))
    }
}

async fn run_pump(
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<BusMessage>,
    ready: oneshot::Sender<Result<(), ConnectError>>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    epoch: u64,
) {
    let mut ready = Some(ready);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    state.send_replace(ConnectionState::Connected);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                } else {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    state.send_replace(ConnectionState::Error);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(ConnectError::Transport(reason)));
                    }
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = BusMessage::new(publish.topic, publish.payload.to_vec(), epoch);
                // Cancellation wins over a full channel so teardown never waits on the bridge
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = inbound.send(msg) => {
                        if sent.is_err() {
                            debug!("Inbound receiver dropped, stopping pump {}", epoch);
                            break;
                        }
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent (session {})", epoch);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                state.send_replace(ConnectionState::Error);
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(ConnectError::Transport(e.to_string())));
                    }
                    None => warn!("Broker connection lost (session {}): {}", epoch, e),
                }
                break;
            }
        }
    }

    if *state.borrow() == ConnectionState::Connected {
        state.send_replace(ConnectionState::Disconnected);
    }
    debug!("Receive pump {} stopped", epoch);
}
