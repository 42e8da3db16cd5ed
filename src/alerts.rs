//! Threshold rules over the newest reading of each sensor, plus the durable
//! ledger that remembers which alerts an operator resolved.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::models::{Quantity, Reading, Sensor};

/// Above `max + this` a temperature reading is critical.
pub const TEMPERATURE_CRITICAL_OFFSET: f64 = 5.0;
/// Above `max + this` a moisture reading is critical.
pub const MOISTURE_CRITICAL_OFFSET: f64 = 10.0;
pub const BATTERY_WARNING_LEVEL: f64 = 20.0;
pub const BATTERY_CRITICAL_LEVEL: f64 = 10.0;
/// Resolutions older than this are pruned on every ledger write.
pub const LEDGER_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertRule {
    Temperature,
    Moisture,
    Battery,
}

impl From<Quantity> for AlertRule {
    fn from(q: Quantity) -> Self {
        match q {
            Quantity::Temperature => AlertRule::Temperature,
            Quantity::Moisture => AlertRule::Moisture,
        }
    }
}

impl fmt::Display for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertRule::Temperature => "temperature",
            AlertRule::Moisture => "moisture",
            AlertRule::Battery => "battery",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

/// One rule firing, before resolution status is known.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub sensor_id: String,
    pub rule: AlertRule,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub generated_at: DateTime<Utc>,
}

impl AlertCandidate {
    /// Stable identity of this firing: same sensor, rule, severity and
    /// threshold always produce the same key.
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.sensor_id, self.rule, self.severity, self.threshold)
    }
}

pub fn dedup_key(sensor_id: &str, rule: AlertRule, severity: Severity, threshold: f64) -> String {
    format!("{sensor_id}:{rule}:{severity}:{threshold:.2}")
}

/// Alert as exposed to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AlertRecord {
    /// UUID v5 of `dedup_key`.
    pub id: Uuid,
    pub dedup_key: String,
    pub sensor_id: String,
    pub rule: AlertRule,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub generated_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

pub fn alert_id(dedup_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, dedup_key.as_bytes())
}

/// Evaluate every rule for one sensor against its newest reading.
///
/// At most one alert per (sensor, rule) fires; critical supersedes warning.
pub fn evaluate(sensor: &Sensor, reading: &Reading, charging: bool) -> Vec<AlertCandidate> {
    let mut out = Vec::new();
    let mut fire = |rule: AlertRule, severity: Severity, value: f64, threshold: f64| {
        out.push(AlertCandidate {
            sensor_id: sensor.id.clone(),
            rule,
            severity,
            value,
            threshold,
            generated_at: reading.timestamp,
        });
    };

    for q in sensor.quantities.iter() {
        let (Some(value), Some(range)) = (reading.value(q), sensor.range(q)) else {
            continue;
        };
        match q {
            Quantity::Temperature => {
                let critical = range.max + TEMPERATURE_CRITICAL_OFFSET;
                if value > critical {
                    fire(q.into(), Severity::Critical, value, critical);
                } else if value > range.max {
                    fire(q.into(), Severity::Warning, value, range.max);
                }
            }
            Quantity::Moisture => {
                let critical = range.max + MOISTURE_CRITICAL_OFFSET;
                if value > critical {
                    fire(q.into(), Severity::Critical, value, critical);
                }
            }
        }
    }

    if !charging {
        let level = reading.battery;
        if level < BATTERY_CRITICAL_LEVEL {
            fire(AlertRule::Battery, Severity::Critical, level, BATTERY_CRITICAL_LEVEL);
        } else if level < BATTERY_WARNING_LEVEL {
            fire(AlertRule::Battery, Severity::Warning, level, BATTERY_WARNING_LEVEL);
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved: bool,
    pub resolved_at: DateTime<Utc>,
}

/// Dedup key → resolution. Persisted as a whole on every write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolutionLedger {
    entries: BTreeMap<String, Resolution>,
}

impl ResolutionLedger {
    pub fn get(&self, key: &str) -> Option<&Resolution> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `key` as resolved at `now`, pruning expired entries.
    pub fn mark_resolved(&mut self, key: &str, now: DateTime<Utc>) {
        self.entries.insert(
            key.to_owned(),
            Resolution { resolved: true, resolved_at: now },
        );
        self.prune(now);
    }

    /// Drop entries resolved more than [`LEDGER_TTL_DAYS`] before `now`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(LEDGER_TTL_DAYS);
        self.entries.retain(|_, r| r.resolved_at >= cutoff);
    }

    /// Drop every resolution recorded for `sensor_id`. Returns whether
    /// anything was removed.
    pub fn forget_sensor(&mut self, sensor_id: &str) -> bool {
        let prefix = format!("{sensor_id}:");
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(&prefix));
        self.entries.len() != before
    }

    /// Attach resolution status to freshly evaluated candidates.
    pub fn reconcile(&self, candidates: Vec<AlertCandidate>) -> Vec<AlertRecord> {
        candidates
            .into_iter()
            .map(|c| {
                let key = c.dedup_key();
                let resolution = self.get(&key).filter(|r| r.resolved);
                AlertRecord {
                    id: alert_id(&key),
                    resolved: resolution.is_some(),
                    resolved_at: resolution.map(|r| r.resolved_at),
                    dedup_key: key,
                    sensor_id: c.sensor_id,
                    rule: c.rule,
                    severity: c.severity,
                    value: c.value,
                    threshold: c.threshold,
                    generated_at: c.generated_at,
                }
            })
            .collect()
    }
}
