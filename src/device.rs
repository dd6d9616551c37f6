//! Meter devices fed by the router
//!
//! A [`MeterDevice`] owns one topic. Its task turns each reading into capability
//! values and forwards them as [`DeviceUpdate`]s. Malformed readings are logged
//! and skipped.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::catalog::{parse_reading, CapabilityCatalog};
use crate::capability::migration::{legacy_v1_target, CapabilityMigration};
use crate::mqtt::error::PayloadError;
use crate::mqtt::message::BusMessage;
use crate::routing::router::MessageSink;
use crate::routing::topic::TopicPattern;

const DEVICE_INBOX: usize = 32;

/// A configured meter, as stored in the config file.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub id: String,
    /// Explicit topic; derived from the discovery pattern when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Capabilities found by discovery. Empty means every known capability.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub capabilities: BTreeSet<String>,
}

impl DeviceConfig {
    pub fn topic(&self, pattern: &TopicPattern) -> String {
        self.topic
            .clone()
            .unwrap_or_else(|| pattern.topic_for(&self.id))
    }

    /// Rewrites stored v1 capability ids. True when anything changed.
    pub fn migrate_capabilities(&mut self) -> bool {
        let target = legacy_v1_target(&self.capabilities);
        let plan = CapabilityMigration::plan(&self.capabilities, &target);
        if plan.is_empty() {
            return false;
        }
        info!(
            "Device {}: migrating capabilities, adding {:?}, removing {:?}",
            self.id, plan.add, plan.remove
        );
        self.capabilities = plan.apply(&self.capabilities);
        true
    }

    /// The device this entry describes, listening on its topic.
    pub fn device(&self, pattern: &TopicPattern) -> MeterDevice {
        let device = MeterDevice::new(self.id.as_str(), self.topic(pattern));
        if self.capabilities.is_empty() {
            device
        } else {
            device.with_capabilities(self.capabilities.clone())
        }
    }
}

/// Capability values decoded from one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceUpdate {
    pub device_id: String,
    pub values: BTreeMap<String, f64>,
    pub received_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct MeterDevice {
    id: String,
    topic: String,
    capabilities: BTreeSet<String>,
    catalog: CapabilityCatalog,
}

impl MeterDevice {
    /// A device exposing every capability the catalog knows.
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        let catalog = CapabilityCatalog::default();
        Self {
            id: id.into(),
            topic: topic.into(),
            capabilities: catalog.all_capabilities(),
            catalog,
        }
    }

    /// Restricts the device to `capabilities`, e.g. the ones discovery inferred.
    pub fn with_capabilities(mut self, capabilities: BTreeSet<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    /// Values for the capabilities this device has. Others are ignored.
    pub fn read(&self, msg: &BusMessage) -> Result<DeviceUpdate, PayloadError> {
        let reading = parse_reading(&msg.topic, &msg.payload)?;
        let values = self
            .catalog
            .values(&reading)
            .into_iter()
            .filter(|(capability, _)| self.capabilities.contains(capability))
            .collect();
        Ok(DeviceUpdate {
            device_id: self.id.clone(),
            values,
            received_at: msg.received_at,
        })
    }

    /// Runs the device until `cancel` fires or its inbox closes. Register the
    /// returned sink with the bridge for [`MeterDevice::topic`].
    pub fn spawn(
        self,
        updates: mpsc::Sender<DeviceUpdate>,
        cancel: CancellationToken,
    ) -> (MessageSink, JoinHandle<()>) {
        let (sink, inbox) = mpsc::channel(DEVICE_INBOX);
        let handle = tokio::spawn(self.run(inbox, updates, cancel));
        (sink, handle)
    }

    async fn run(
        self,
        mut inbox: mpsc::Receiver<BusMessage>,
        updates: mpsc::Sender<DeviceUpdate>,
        cancel: CancellationToken,
    ) {
        info!("Device {} listening on {}", self.id, self.topic);
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match self.read(&msg) {
                Ok(update) => {
                    if updates.send(update).await.is_err() {
                        debug!("Update receiver for {} is gone", self.id);
                        break;
                    }
                }
                Err(e) => warn!("Device {}: {}", self.id, e),
            }
        }
        debug!("Device {} stopped", self.id);
    }
}
