//! Reading-to-capability mapping and capability-set migration

pub mod catalog;
pub mod migration;

pub use catalog::{parse_reading, CapabilityCatalog, Reading, ReadingField, Scale, READING_FIELDS};
pub use migration::{legacy_v1_target, CapabilityMigration};
