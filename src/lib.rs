//! # watts-bridge
//!
//! Bridges power-meter telemetry published on an MQTT bus to addressable
//! meter devices, and discovers new meters by watching the bus during pairing.
//!
//! ```text
//! src/
//! ├── mqtt/        - connectors for the direct and host-managed transports
//! ├── routing/     - topic patterns and the per-connector router
//! ├── health.rs    - liveness record and staleness verdicts
//! ├── discovery/   - pairing session state machine and capability inference
//! ├── capability/  - reading-to-capability table and capability migration
//! ├── device.rs    - meter devices fed by the router
//! ├── bridge.rs    - the coordinator task tying it together
//! └── config.rs    - config.toml
//! ```

pub mod bridge;
pub mod capability;
pub mod config;
pub mod device;
pub mod discovery;
pub mod health;
pub mod mqtt;
pub mod routing;

pub use bridge::{Bridge, BridgeError, BridgeHandle, BridgeOptions, BridgeStatus};
pub use config::BridgeConfig;
