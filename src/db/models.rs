use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A physical quantity a sensor can monitor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Temperature,
    Moisture,
}

impl Quantity {
    pub const ALL: [Quantity; 2] = [Quantity::Temperature, Quantity::Moisture];

    fn bit(self) -> u8 {
        match self {
            Quantity::Temperature => 0b01,
            Quantity::Moisture => 0b10,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quantity::Temperature => "temperature",
            Quantity::Moisture => "moisture",
        })
    }
}

/// Set of monitored quantities, stored as a bitmask.
///
/// Serialized as a list (`["temperature", "moisture"]`) so persisted records
/// stay readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Quantity>", into = "Vec<Quantity>")]
pub struct QuantitySet(u8);

impl QuantitySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Quantity::ALL.into_iter().collect()
    }

    pub fn contains(self, q: Quantity) -> bool {
        self.0 & q.bit() != 0
    }

    pub fn insert(&mut self, q: Quantity) {
        self.0 |= q.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Quantity> {
        Quantity::ALL.into_iter().filter(move |q| self.contains(*q))
    }
}

impl FromIterator<Quantity> for QuantitySet {
    fn from_iter<I: IntoIterator<Item = Quantity>>(iter: I) -> Self {
        let mut set = Self::empty();
        for q in iter {
            set.insert(q);
        }
        set
    }
}

impl From<Vec<Quantity>> for QuantitySet {
    fn from(v: Vec<Quantity>) -> Self {
        v.into_iter().collect()
    }
}

impl From<QuantitySet> for Vec<Quantity> {
    fn from(s: QuantitySet) -> Self {
        s.iter().collect()
    }
}

/// Inclusive optimal band for one quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OptimalRange {
    pub min: f64,
    pub max: f64,
}

impl OptimalRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min < self.max
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

/// A registered sensor.
///
/// `id` is the temporary identity (`TEMP-nnn`) until pairing and the permanent
/// one (`SENS-nnn`) afterwards; `temp_id` never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Sensor {
    pub id: String,
    pub temp_id: String,
    pub paired: bool,
    pub pairing_code: Option<String>,
    #[schema(value_type = Vec<Quantity>)]
    pub quantities: QuantitySet,
    #[schema(value_type = Object)]
    pub optimal_ranges: BTreeMap<Quantity, OptimalRange>,
    pub bales_monitored: u32,
    pub location: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub paired_at: Option<DateTime<Utc>>,
}

impl Sensor {
    pub fn range(&self, q: Quantity) -> Option<OptimalRange> {
        self.optimal_ranges.get(&q).copied()
    }
}

/// One immutable sample captured by the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub sensor_id: String,
    /// Degrees Celsius.
    pub temperature: Option<f64>,
    /// Relative moisture percentage.
    pub moisture: Option<f64>,
    /// Battery level (%) at capture time.
    pub battery: f64,
}

impl Reading {
    pub fn value(&self, q: Quantity) -> Option<f64> {
        match q {
            Quantity::Temperature => self.temperature,
            Quantity::Moisture => self.moisture,
        }
    }

    pub fn set_value(&mut self, q: Quantity, v: Option<f64>) {
        match q {
            Quantity::Temperature => self.temperature = v,
            Quantity::Moisture => self.moisture = v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_set_membership() {
        let mut set = QuantitySet::empty();
        assert!(set.is_empty());
        set.insert(Quantity::Moisture);
        assert!(set.contains(Quantity::Moisture));
        assert!(!set.contains(Quantity::Temperature));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Quantity::Moisture]);
    }

    #[test]
    fn quantity_set_serializes_as_list() {
        let json = serde_json::to_value(QuantitySet::all()).unwrap();
        assert_eq!(json, serde_json::json!(["temperature", "moisture"]));

        let back: QuantitySet = serde_json::from_value(json).unwrap();
        assert_eq!(back, QuantitySet::all());
    }

    #[test]
    fn range_validity() {
        assert!(OptimalRange::new(18.0, 25.0).is_valid());
        assert!(!OptimalRange::new(25.0, 25.0).is_valid());
        assert!(!OptimalRange::new(30.0, 25.0).is_valid());
        assert!(!OptimalRange::new(f64::NAN, 25.0).is_valid());
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let r = OptimalRange::new(18.0, 25.0);
        assert!(r.contains(18.0));
        assert!(r.contains(25.0));
        assert!(!r.contains(17.99));
        assert!(!r.contains(25.01));
    }

    #[test]
    fn quantity_display_is_snake_case() {
        assert_eq!(Quantity::Temperature.to_string(), "temperature");
        assert_eq!(Quantity::Moisture.to_string(), "moisture");
    }

    #[test]
    fn reading_value_accessors() {
        let mut r = Reading {
            timestamp: Utc::now(),
            sensor_id: "SENS-001".into(),
            temperature: Some(21.5),
            moisture: None,
            battery: 88.0,
        };
        assert_eq!(r.value(Quantity::Temperature), Some(21.5));
        r.set_value(Quantity::Moisture, Some(14.0));
        assert_eq!(r.value(Quantity::Moisture), Some(14.0));
    }
}
