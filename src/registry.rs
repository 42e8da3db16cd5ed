use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::{
    db::models::{OptimalRange, Quantity, QuantitySet, Sensor},
    error::{EngineError, EngineResult},
};

const TEMP_PREFIX: &str = "TEMP";
const PERMANENT_PREFIX: &str = "SENS";

/// Configuration supplied when registering a sensor.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SensorConfig {
    #[schema(value_type = Vec<Quantity>)]
    pub quantities: QuantitySet,
    #[schema(value_type = Object)]
    pub optimal_ranges: BTreeMap<Quantity, OptimalRange>,
    #[serde(default)]
    pub bales_monitored: u32,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
}

/// Partial update; absent fields are left untouched. Ranges are merged per
/// quantity.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SensorPatch {
    #[schema(value_type = Option<Vec<Quantity>>)]
    pub quantities: Option<QuantitySet>,
    #[schema(value_type = Option<Object>)]
    pub optimal_ranges: Option<BTreeMap<Quantity, OptimalRange>>,
    pub bales_monitored: Option<u32>,
    pub location: Option<String>,
    pub description: Option<String>,
}

/// Owns every sensor record, paired or not, in creation order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sensors: Vec<Sensor>,
}

impl Registry {
    pub fn from_snapshot(sensors: Vec<Sensor>) -> Self {
        Self { sensors }
    }

    pub fn snapshot(&self) -> &[Sensor] {
        &self.sensors
    }

    /// Look up by current id; falls back to the temporary id.
    pub fn get(&self, id: &str) -> Option<&Sensor> {
        self.position(id).map(|i| &self.sensors[i])
    }

    pub fn paired(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.iter().filter(|s| s.paired)
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Register a new, unpaired sensor under the next `TEMP-nnn` id.
    pub fn add(&mut self, config: SensorConfig, now: DateTime<Utc>) -> EngineResult<Sensor> {
        validate(config.quantities, &config.optimal_ranges)?;

        let temp_id = format_id(TEMP_PREFIX, self.max_number(TEMP_PREFIX, |s| &s.temp_id) + 1);
        let sensor = Sensor {
            id: temp_id.clone(),
            temp_id,
            paired: false,
            pairing_code: None,
            quantities: config.quantities,
            optimal_ranges: config.optimal_ranges,
            bales_monitored: config.bales_monitored,
            location: config.location,
            description: config.description,
            created_at: now,
            paired_at: None,
        };
        self.sensors.push(sensor.clone());
        Ok(sensor)
    }

    /// Assign the next permanent id to the sensor registered as `temp_id`.
    pub fn pair(&mut self, temp_id: &str, code: &str, now: DateTime<Utc>) -> EngineResult<Sensor> {
        let idx = self
            .sensors
            .iter()
            .position(|s| s.temp_id == temp_id)
            .ok_or_else(|| EngineError::sensor_not_found(temp_id))?;
        if self.sensors[idx].paired {
            return Err(EngineError::AlreadyPaired(temp_id.to_owned()));
        }
        let code = code.trim();
        if code.is_empty() {
            return Err(EngineError::InvalidConfig("pairing code must not be empty".into()));
        }

        let id = format_id(PERMANENT_PREFIX, self.max_number(PERMANENT_PREFIX, |s| &s.id) + 1);
        let sensor = &mut self.sensors[idx];
        sensor.id = id;
        sensor.paired = true;
        sensor.pairing_code = Some(code.to_owned());
        sensor.paired_at = Some(now);
        Ok(sensor.clone())
    }

    /// Apply `patch` atomically: nothing changes unless the merged result is valid.
    pub fn update_config(&mut self, id: &str, patch: SensorPatch) -> EngineResult<Sensor> {
        let idx = self.position(id).ok_or_else(|| EngineError::sensor_not_found(id))?;

        let mut updated = self.sensors[idx].clone();
        if let Some(q) = patch.quantities {
            updated.quantities = q;
        }
        if let Some(ranges) = patch.optimal_ranges {
            updated.optimal_ranges.extend(ranges);
        }
        if let Some(b) = patch.bales_monitored {
            updated.bales_monitored = b;
        }
        if let Some(l) = patch.location {
            updated.location = l;
        }
        if let Some(d) = patch.description {
            updated.description = d;
        }
        validate(updated.quantities, &updated.optimal_ranges)?;

        self.sensors[idx] = updated.clone();
        Ok(updated)
    }

    pub fn remove(&mut self, id: &str) -> EngineResult<Sensor> {
        let idx = self.position(id).ok_or_else(|| EngineError::sensor_not_found(id))?;
        Ok(self.sensors.remove(idx))
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.sensors
            .iter()
            .position(|s| s.id == id)
            .or_else(|| self.sensors.iter().position(|s| s.temp_id == id))
    }

    fn max_number(&self, prefix: &str, field: impl Fn(&Sensor) -> &String) -> u32 {
        self.sensors
            .iter()
            .filter_map(|s| parse_number(prefix, field(s)))
            .max()
            .unwrap_or(0)
    }
}

fn validate(quantities: QuantitySet, ranges: &BTreeMap<Quantity, OptimalRange>) -> EngineResult<()> {
    if quantities.is_empty() {
        return Err(EngineError::InvalidConfig("at least one monitored quantity is required".into()));
    }
    for q in quantities.iter() {
        if !ranges.contains_key(&q) {
            return Err(EngineError::InvalidConfig(format!("missing optimal range for {q}")));
        }
    }
    for (q, range) in ranges {
        if !range.is_valid() {
            return Err(EngineError::InvalidConfig(format!(
                "optimal range for {q} must satisfy min < max (got {} .. {})",
                range.min, range.max
            )));
        }
    }
    Ok(())
}

fn format_id(prefix: &str, n: u32) -> String {
    format!("{prefix}-{n:03}")
}

fn parse_number(prefix: &str, id: &str) -> Option<u32> {
    id.strip_prefix(prefix)?.strip_prefix('-')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config() -> SensorConfig {
        SensorConfig {
            quantities: [Quantity::Temperature].into_iter().collect(),
            optimal_ranges: BTreeMap::from([(Quantity::Temperature, OptimalRange::new(18.0, 25.0))]),
            bales_monitored: 40,
            location: "Barn 2".into(),
            description: "north stack".into(),
        }
    }

    #[test]
    fn add_assigns_sequential_temp_ids() {
        let mut reg = Registry::default();
        let a = reg.add(temp_config(), Utc::now()).unwrap();
        let b = reg.add(temp_config(), Utc::now()).unwrap();
        assert_eq!(a.id, "TEMP-001");
        assert_eq!(b.id, "TEMP-002");
        assert!(!a.paired);
        assert_eq!(a.temp_id, a.id);
    }

    #[test]
    fn pair_once_then_already_paired() {
        let mut reg = Registry::default();
        reg.add(temp_config(), Utc::now()).unwrap();

        let paired = reg.pair("TEMP-001", "QR-X", Utc::now()).unwrap();
        assert_eq!(paired.id, "SENS-001");
        assert!(paired.paired);
        assert_eq!(paired.pairing_code.as_deref(), Some("QR-X"));
        assert!(paired.paired_at.is_some());

        let err = reg.pair("TEMP-001", "QR-X", Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyPaired(id) if id == "TEMP-001"));
    }

    #[test]
    fn pair_allocates_after_current_max() {
        let mut reg = Registry::from_snapshot(Vec::new());
        for _ in 0..3 {
            reg.add(temp_config(), Utc::now()).unwrap();
        }
        reg.pair("TEMP-001", "a", Utc::now()).unwrap();
        reg.pair("TEMP-002", "b", Utc::now()).unwrap();
        reg.remove("SENS-001").unwrap();

        // max existing is SENS-002 → next is SENS-003
        let s = reg.pair("TEMP-003", "c", Utc::now()).unwrap();
        assert_eq!(s.id, "SENS-003");
    }

    #[test]
    fn pair_unknown_is_not_found() {
        let mut reg = Registry::default();
        let err = reg.pair("TEMP-999", "QR", Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { what: "sensor", .. }));
    }

    #[test]
    fn pair_with_blank_code_leaves_sensor_unpaired() {
        let mut reg = Registry::default();
        reg.add(temp_config(), Utc::now()).unwrap();
        assert!(matches!(
            reg.pair("TEMP-001", "  ", Utc::now()),
            Err(EngineError::InvalidConfig(_))
        ));
        assert!(!reg.get("TEMP-001").unwrap().paired);
    }

    #[test]
    fn add_rejects_inverted_range() {
        let mut reg = Registry::default();
        let mut cfg = temp_config();
        cfg.optimal_ranges.insert(Quantity::Temperature, OptimalRange::new(25.0, 18.0));
        assert!(matches!(reg.add(cfg, Utc::now()), Err(EngineError::InvalidConfig(_))));
        assert!(reg.is_empty());
    }

    #[test]
    fn add_rejects_missing_range_for_monitored_quantity() {
        let mut reg = Registry::default();
        let mut cfg = temp_config();
        cfg.quantities.insert(Quantity::Moisture);
        let err = reg.add(cfg, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("moisture"));
    }

    #[test]
    fn update_config_is_all_or_nothing() {
        let mut reg = Registry::default();
        reg.add(temp_config(), Utc::now()).unwrap();

        let bad = SensorPatch {
            location: Some("Barn 9".into()),
            optimal_ranges: Some(BTreeMap::from([(Quantity::Temperature, OptimalRange::new(5.0, 5.0))])),
            ..Default::default()
        };
        assert!(reg.update_config("TEMP-001", bad).is_err());
        assert_eq!(reg.get("TEMP-001").unwrap().location, "Barn 2");

        let good = SensorPatch {
            location: Some("Barn 9".into()),
            quantities: Some(QuantitySet::all()),
            optimal_ranges: Some(BTreeMap::from([(Quantity::Moisture, OptimalRange::new(12.0, 18.0))])),
            ..Default::default()
        };
        let s = reg.update_config("TEMP-001", good).unwrap();
        assert_eq!(s.location, "Barn 9");
        assert_eq!(s.range(Quantity::Temperature), Some(OptimalRange::new(18.0, 25.0)));
        assert_eq!(s.range(Quantity::Moisture), Some(OptimalRange::new(12.0, 18.0)));
    }

    #[test]
    fn get_resolves_temp_id_after_pairing() {
        let mut reg = Registry::default();
        reg.add(temp_config(), Utc::now()).unwrap();
        reg.pair("TEMP-001", "QR", Utc::now()).unwrap();
        assert_eq!(reg.get("TEMP-001").unwrap().id, "SENS-001");
        assert_eq!(reg.get("SENS-001").unwrap().temp_id, "TEMP-001");
    }

    #[test]
    fn parse_number_ignores_foreign_ids() {
        assert_eq!(parse_number("SENS", "SENS-012"), Some(12));
        assert_eq!(parse_number("SENS", "TEMP-012"), None);
        assert_eq!(parse_number("SENS", "SENSOR-1"), None);
    }
}
