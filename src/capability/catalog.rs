//! Meter reading fields and the capabilities they feed

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::mqtt::error::PayloadError;

/// How a raw field value is converted before it is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    /// Instantaneous power, voltage and current, taken as is
    Unit,
    /// Cumulative energy reported in Wh, assigned in kWh
    Kilo,
}

impl Scale {
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            Scale::Unit => raw,
            Scale::Kilo => raw / 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadingField {
    pub field: &'static str,
    pub capability: &'static str,
    pub scale: Scale,
}

const fn power(field: &'static str, capability: &'static str) -> ReadingField {
    ReadingField {
        field,
        capability,
        scale: Scale::Unit,
    }
}

const fn energy(field: &'static str, capability: &'static str) -> ReadingField {
    ReadingField {
        field,
        capability,
        scale: Scale::Kilo,
    }
}

pub const READING_FIELDS: [ReadingField; 20] = [
    energy("positive_active_energy", "meter_power.imported"),
    power("positive_active_power", "measure_power"),
    power("positive_active_power_l1", "measure_power.l1"),
    power("positive_active_power_l2", "measure_power.l2"),
    power("positive_active_power_l3", "measure_power.l3"),
    power("current_l1", "measure_current.l1"),
    power("current_l2", "measure_current.l2"),
    power("current_l3", "measure_current.l3"),
    power("voltage_l1", "measure_voltage.l1"),
    power("voltage_l2", "measure_voltage.l2"),
    power("voltage_l3", "measure_voltage.l3"),
    energy("negative_active_energy", "meter_power.exported"),
    power("negative_active_power", "measure_power.negative_active"),
    power("negative_active_power_l1", "measure_power.negative_l1"),
    power("negative_active_power_l2", "measure_power.negative_l2"),
    power("negative_active_power_l3", "measure_power.negative_l3"),
    energy("negative_reactive_energy", "meter_power.negative_reactive"),
    power("negative_reactive_power", "measure_power.negative_reactive"),
    energy("positive_reactive_energy", "meter_power.positive_reactive"),
    power("positive_reactive_power", "measure_power.positive_reactive"),
];

/// A parsed reading: field name to raw JSON value.
pub type Reading = Map<String, Value>;

/// Lookup from reading field to capability identifier.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityCatalog {
    fields: &'static [ReadingField],
}

impl Default for CapabilityCatalog {
    fn default() -> Self {
        Self {
            fields: &READING_FIELDS,
        }
    }
}

impl CapabilityCatalog {
    pub fn lookup(&self, field: &str) -> Option<&'static ReadingField> {
        self.fields.iter().find(|entry| entry.field == field)
    }

    pub fn capability_for(&self, field: &str) -> Option<&'static str> {
        self.lookup(field).map(|entry| entry.capability)
    }

    /// Every capability this catalog can produce.
    pub fn all_capabilities(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .map(|entry| entry.capability.to_string())
            .collect()
    }

    /// Capabilities backed by a non-null field of `reading`.
    pub fn capabilities_present(&self, reading: &Reading) -> BTreeSet<String> {
        reading
            .iter()
            .filter(|(_, value)| !value.is_null())
            .filter_map(|(field, _)| self.capability_for(field))
            .map(str::to_string)
            .collect()
    }

    /// Scaled capability values for every numeric field of `reading`.
    /// Unknown and non-numeric fields are left out.
    pub fn values(&self, reading: &Reading) -> BTreeMap<String, f64> {
        reading
            .iter()
            .filter_map(|(field, value)| {
                let entry = self.lookup(field)?;
                let raw = value.as_f64()?;
                Some((entry.capability.to_string(), entry.scale.apply(raw)))
            })
            .collect()
    }
}

/// Reads `payload` as a JSON object.
pub fn parse_reading(topic: &str, payload: &[u8]) -> Result<Reading, PayloadError> {
    let malformed = |reason: String| PayloadError::Malformed {
        topic: topic.to_string(),
        reason,
    };
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(reading)) => Ok(reading),
        Ok(other) => Err(malformed(format!("expected an object, got {}", kind_of(&other)))),
        Err(e) => Err(malformed(e.to_string())),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_is_scaled_to_kwh() {
        let catalog = CapabilityCatalog::default();
        let reading = parse_reading("t", br#"{"positive_active_energy": 1198712}"#).unwrap();
        let values = catalog.values(&reading);
        assert_eq!(values.get("meter_power.imported"), Some(&1198.712));
    }

    #[test]
    fn test_power_is_not_scaled() {
        let catalog = CapabilityCatalog::default();
        let reading =
            parse_reading("t", br#"{"positive_active_power": 100, "voltage_l1": 230.5}"#).unwrap();
        let values = catalog.values(&reading);
        assert_eq!(values.get("measure_power"), Some(&100.0));
        assert_eq!(values.get("measure_voltage.l1"), Some(&230.5));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_null_and_unknown_fields_are_absent() {
        let catalog = CapabilityCatalog::default();
        let reading = parse_reading(
            "t",
            br#"{"positive_active_power": 100, "current_l1": null, "firmware": "1.2"}"#,
        )
        .unwrap();
        let present = catalog.capabilities_present(&reading);
        assert_eq!(present, BTreeSet::from(["measure_power".to_string()]));
    }

    #[test]
    fn test_every_field_has_a_distinct_capability() {
        let catalog = CapabilityCatalog::default();
        assert_eq!(catalog.all_capabilities().len(), READING_FIELDS.len());
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            parse_reading("watts/A/measurement", b"not json"),
            Err(PayloadError::Malformed { .. })
        ));
        let err = parse_reading("watts/A/measurement", b"[1, 2]").unwrap_err();
        assert_eq!(
            err,
            PayloadError::Malformed {
                topic: "watts/A/measurement".to_string(),
                reason: "expected an object, got an array".to_string(),
            }
        );
    }
}
