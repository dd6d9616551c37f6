//! Capability-set migration between driver generations
//!
//! A device stores the capability ids it was created with. When the id scheme
//! changes, [`CapabilityMigration::plan`] computes what to add and remove to
//! reach the target set. Planning against an already migrated device yields an
//! empty plan, so running it on every startup is safe.

use std::collections::BTreeSet;

/// v1 capability ids and their replacements.
pub const LEGACY_V1_RENAMES: [(&str, &str); 19] = [
    ("meter_power", "meter_power.imported"),
    ("measure_power_l1", "measure_power.l1"),
    ("measure_power_l2", "measure_power.l2"),
    ("measure_power_l3", "measure_power.l3"),
    ("measure_voltage_l1", "measure_voltage.l1"),
    ("measure_voltage_l2", "measure_voltage.l2"),
    ("measure_voltage_l3", "measure_voltage.l3"),
    ("measure_current_l1", "measure_current.l1"),
    ("measure_current_l2", "measure_current.l2"),
    ("measure_current_l3", "measure_current.l3"),
    ("measure_negative_active_energy", "meter_power.exported"),
    ("measure_negative_active_power", "measure_power.negative_active"),
    ("measure_negative_power_l1", "measure_power.negative_l1"),
    ("measure_negative_power_l2", "measure_power.negative_l2"),
    ("measure_negative_power_l3", "measure_power.negative_l3"),
    ("measure_positive_reactive_energy", "meter_power.positive_reactive"),
    ("measure_negative_reactive_energy", "meter_power.negative_reactive"),
    ("measure_negative_reactive_power", "measure_power.negative_reactive"),
    ("measure_positive_reactive_power", "measure_power.positive_reactive"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityMigration {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl CapabilityMigration {
    pub fn plan(current: &BTreeSet<String>, target: &BTreeSet<String>) -> Self {
        Self {
            add: target.difference(current).cloned().collect(),
            remove: current.difference(target).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// The set that results from applying this plan to `current`.
    pub fn apply(&self, current: &BTreeSet<String>) -> BTreeSet<String> {
        let mut next = current.clone();
        for capability in &self.remove {
            next.remove(capability);
        }
        next.extend(self.add.iter().cloned());
        next
    }
}

/// Rewrites every v1 id in `current` to its v2 id, keeping everything else.
pub fn legacy_v1_target(current: &BTreeSet<String>) -> BTreeSet<String> {
    current
        .iter()
        .map(|capability| {
            LEGACY_V1_RENAMES
                .iter()
                .find(|(old, _)| *old == capability.as_str())
                .map_or_else(|| capability.clone(), |(_, new)| new.to_string())
        })
        .collect()
}
