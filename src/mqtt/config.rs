use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which bus client provider a connector wraps.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Broker access through the shared, process-wide broker proxy.
    HostManaged,
    /// A broker connection owned by this connector alone.
    #[default]
    Direct,
}

/// Settings for a single connection attempt.
///
/// Immutable once handed to a connector. A settings change produces a new
/// value, and [`ConnectionConfig::requires_reconnect`] decides whether the
/// current connector has to be torn down.
#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub transport: TransportKind,
    pub hostname: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    /// PEM encoded CA certificate
    pub ca_certificate: String,
    /// PEM encoded client certificate, used together with `client_key`
    pub client_certificate: String,
    pub client_key: String,
    pub reject_unauthorized: bool,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Direct,
            hostname: "localhost".to_string(),
            port: 1883,
            client_id: "watts-bridge".to_string(),
            username: String::new(),
            password: String::new(),
            use_tls: false,
            ca_certificate: String::new(),
            client_certificate: String::new(),
            client_key: String::new(),
            reject_unauthorized: true,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

// Password and key material stay out of the logs
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("transport", &self.transport)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("use_tls", &self.use_tls)
            .field("ca_certificate", &redacted(&self.ca_certificate))
            .field("client_certificate", &redacted(&self.client_certificate))
            .field("client_key", &redacted(&self.client_key))
            .field("reject_unauthorized", &self.reject_unauthorized)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

/// The part of a [`ConnectionConfig`] that decides which broker session is used.
///
/// Two configs with equal keys can share a live connector; any inequality means
/// the connector has to be rebuilt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportKey<'a> {
    HostManaged,
    Direct {
        hostname: &'a str,
        port: u16,
        client_id: &'a str,
        username: &'a str,
        password: &'a str,
        tls: Option<TlsKey<'a>>,
        keep_alive_secs: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsKey<'a> {
    pub ca_certificate: &'a str,
    pub client_certificate: &'a str,
    pub client_key: &'a str,
    pub reject_unauthorized: bool,
}

impl ConnectionConfig {
    /// Config selecting the shared host-managed proxy.
    pub fn host_managed() -> Self {
        Self {
            transport: TransportKind::HostManaged,
            ..Self::default()
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn transport_key(&self) -> TransportKey<'_> {
        match self.transport {
            // The proxy owns its own broker settings
            TransportKind::HostManaged => TransportKey::HostManaged,
            TransportKind::Direct => TransportKey::Direct {
                hostname: &self.hostname,
                port: self.port,
                client_id: &self.client_id,
                username: &self.username,
                password: &self.password,
                tls: self.use_tls.then(|| TlsKey {
                    ca_certificate: &self.ca_certificate,
                    client_certificate: &self.client_certificate,
                    client_key: &self.client_key,
                    reject_unauthorized: self.reject_unauthorized,
                }),
                keep_alive_secs: self.keep_alive_secs,
            },
        }
    }

    /// True when switching from `self` to `next` invalidates the live connector.
    pub fn requires_reconnect(&self, next: &ConnectionConfig) -> bool {
        self.transport_key() != next.transport_key()
    }

    /// `host:port` for log lines.
    pub fn endpoint(&self) -> String {
        match self.transport {
            TransportKind::HostManaged => "host-managed proxy".to_string(),
            TransportKind::Direct => format!("{}:{}", self.hostname, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_change_requires_reconnect() {
        let current = ConnectionConfig::default();
        let next = ConnectionConfig {
            password: "secret".to_string(),
            ..current.clone()
        };
        assert!(current.requires_reconnect(&next));
    }

    #[test]
    fn test_connect_timeout_change_keeps_connector() {
        let current = ConnectionConfig::default();
        let next = ConnectionConfig {
            connect_timeout_secs: 30,
            ..current.clone()
        };
        assert!(!current.requires_reconnect(&next));
    }

    #[test]
    fn test_tls_material_ignored_without_tls() {
        let current = ConnectionConfig::default();
        let next = ConnectionConfig {
            ca_certificate: "-----BEGIN CERTIFICATE-----".to_string(),
            ..current.clone()
        };
        assert!(!current.requires_reconnect(&next));

        let tls_on = ConnectionConfig {
            use_tls: true,
            ..next.clone()
        };
        assert!(next.requires_reconnect(&tls_on));
    }

    #[test]
    fn test_host_managed_ignores_broker_address() {
        let current = ConnectionConfig::host_managed();
        let next = ConnectionConfig {
            hostname: "broker.lan".to_string(),
            port: 8883,
            ..current.clone()
        };
        assert!(!current.requires_reconnect(&next));

        let direct = ConnectionConfig {
            transport: TransportKind::Direct,
            ..next
        };
        assert!(current.requires_reconnect(&direct));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = ConnectionConfig {
            password: "hunter2".to_string(),
            ..ConnectionConfig::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_transport_kind_serde_names() {
        let config: ConnectionConfig =
            toml::from_str("transport = \"host_managed\"\nport = 1884").unwrap();
        assert_eq!(config.transport, TransportKind::HostManaged);
        assert_eq!(config.port, 1884);
        assert_eq!(config.hostname, "localhost");
    }
}
