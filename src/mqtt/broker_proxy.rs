//! A process-wide broker proxy over one rumqttc connection
//!
//! Stands in for the host platform's broker app when the bridge runs on its
//! own: one long-lived connection, shared by every host-managed connector
//! through [`SharedHostBroker`](super::host::SharedHostBroker). Unlike a direct
//! connector it keeps itself connected, the way a host service would, and
//! reports install/uninstall on its realtime stream.
//!
//! The link is closed when the last lease is released and opened again by the
//! next `is_installed`. The realtime stream and the install flag outlive the
//! link, so receivers handed out earlier keep working.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ConnectionConfig;
use super::error::ConnectError;
use super::host::{HostBrokerProxy, ProxyError, ProxyEvent};
use super::tls;

const REALTIME_CAPACITY: usize = 1024;
const REQUEST_CAPACITY: usize = 128;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const INSTALL_GRACE: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

struct ProxyLink {
    client: AsyncClient,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

pub struct MqttBrokerProxy {
    options: MqttOptions,
    endpoint: String,
    events: broadcast::Sender<ProxyEvent>,
    installed: Arc<watch::Sender<bool>>,
    topics: Arc<Mutex<BTreeSet<String>>>,
    link: Mutex<Option<ProxyLink>>,
    closed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MqttBrokerProxy {
    /// Starts the shared connection. Connection problems surface later
    /// through `is_installed`, not here.
    pub fn start(config: &ConnectionConfig) -> Result<Arc<Self>, ConnectError> {
        let options = tls::mqtt_options(config)?;
        let (events, _) = broadcast::channel(REALTIME_CAPACITY);
        let (installed, _) = watch::channel(false);

        let proxy = Arc::new(Self {
            options,
            endpoint: config.endpoint(),
            events,
            installed: Arc::new(installed),
            topics: Arc::new(Mutex::new(BTreeSet::new())),
            link: Mutex::new(None),
            closed: CancellationToken::new(),
        });
        info!("Starting shared broker proxy for {}", proxy.endpoint);
        proxy
            .link_client()
            .map_err(|e| ConnectError::UpstreamUnavailable(e.to_string()))?;
        Ok(proxy)
    }

    /// Whether the broker link is open.
    pub fn is_running(&self) -> bool {
        lock(&self.link).is_some()
    }

    /// Closes the link for good. Later requests fail.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let link = lock(&self.link).take();
        if let Some(link) = link {
            close_link(link).await;
        }
        debug!("Broker proxy shut down");
    }

    /// The client of the open link, opening one if needed.
    fn link_client(&self) -> Result<AsyncClient, ProxyError> {
        if self.closed.is_cancelled() {
            return Err(ProxyError::Request("broker proxy is shut down".to_string()));
        }
        let mut link = lock(&self.link);
        if let Some(current) = link.as_ref() {
            return Ok(current.client.clone());
        }

        debug!("Opening broker proxy link to {}", self.endpoint);
        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(run_proxy_loop(
            eventloop,
            client.clone(),
            self.events.clone(),
            self.installed.clone(),
            self.topics.clone(),
            cancel.clone(),
        ));
        *link = Some(ProxyLink {
            client: client.clone(),
            cancel,
            pump,
        });
        Ok(client)
    }

    fn remember(&self, topic: &str, subscribed: bool) {
        let mut topics = lock(&self.topics);
        if subscribed {
            topics.insert(topic.to_string());
        } else {
            topics.remove(topic);
        }
    }
}

/// Sends DISCONNECT and gives the loop a moment to flush it before cancelling.
async fn close_link(mut link: ProxyLink) {
    let flushed = match link.client.try_disconnect() {
        Ok(()) => tokio::time::timeout(DISCONNECT_GRACE, &mut link.pump)
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
            link.cancel.cancel();
            link.pump.await
        }
    };
    if let Err(e) = joined {
        warn!("Broker proxy loop ended abnormally: {}", e);
    }
}

#[async_trait]
impl HostBrokerProxy for MqttBrokerProxy {
    async fn is_installed(&self) -> Result<bool, ProxyError> {
        self.link_client()?;
        let mut installed = self.installed.subscribe();
        if *installed.borrow() {
            return Ok(true);
        }
        // Give a freshly opened link a moment to reach its broker
        let outcome = match tokio::time::timeout(INSTALL_GRACE, installed.wait_for(|up| *up)).await
        {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) => Err(ProxyError::Request("proxy loop stopped".to_string())),
            Err(_) => Ok(false),
        };
        outcome
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ProxyError> {
        self.remember(topic, true);
        self.link_client()?
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| ProxyError::Request(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProxyError> {
        self.remember(topic, false);
        self.link_client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| ProxyError::Request(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProxyError> {
        if !*self.installed.borrow() {
            return Err(ProxyError::NotInstalled);
        }
        self.link_client()?
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| ProxyError::Request(e.to_string()))
    }

    fn realtime(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    async fn release(&self) {
        let link = lock(&self.link).take();
        if let Some(link) = link {
            info!("Broker proxy has no users left, closing its link");
            close_link(link).await;
        }
    }
}

async fn run_proxy_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    events: broadcast::Sender<ProxyEvent>,
    installed: Arc<watch::Sender<bool>>,
    topics: Arc<Mutex<BTreeSet<String>>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                info!("Broker proxy connected");
                installed.send_replace(true);
                // Clean session: every held topic has to be requested again
                let held: Vec<String> = lock(&topics).iter().cloned().collect();
                for topic in held {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                        warn!("Resubscribe of {} failed: {}", topic, e);
                    }
                }
                let _ = events.send(ProxyEvent::Installed);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = events.send(ProxyEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Broker proxy sent DISCONNECT");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if installed.send_replace(false) {
                    warn!("Broker proxy lost its connection: {}", e);
                    let _ = events.send(ProxyEvent::Uninstalled);
                } else {
                    debug!("Broker proxy still unreachable: {}", e);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    installed.send_replace(false);
    debug!("Broker proxy loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::test_broker::TestBroker;

    #[tokio::test]
    async fn test_release_closes_the_link_until_needed_again() {
        let mut broker = TestBroker::start().await;
        let proxy = MqttBrokerProxy::start(&broker.config).unwrap();
        let mut realtime = proxy.realtime();
        assert_eq!(proxy.is_installed().await, Ok(true));
        assert_eq!(realtime.recv().await, Ok(ProxyEvent::Installed));

        proxy.release().await;
        assert!(!proxy.is_running());
        assert!(broker.closed_session().await.sent_disconnect());
        assert_eq!(
            proxy.publish("watts/A/set", Vec::new()).await,
            Err(ProxyError::NotInstalled)
        );

        // The next user opens a new link
        assert_eq!(proxy.is_installed().await, Ok(true));
        assert!(proxy.is_running());

        proxy.shutdown().await;
        assert!(broker.closed_session().await.sent_disconnect());
        assert!(proxy.is_installed().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_not_installed() {
        // Nothing listens on the discard port
        let config = ConnectionConfig {
            hostname: "127.0.0.1".to_string(),
            port: 9,
            ..ConnectionConfig::default()
        };
        let proxy = MqttBrokerProxy::start(&config).unwrap();
        assert_eq!(proxy.is_installed().await, Ok(false));
        proxy.shutdown().await;
        assert!(!proxy.is_running());
    }
}
