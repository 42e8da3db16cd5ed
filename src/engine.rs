//! The telemetry engine: one object per process owning the registry, power
//! states, history and alert ledger behind a single lock.
//!
//! Every mutation runs to completion while holding that lock, including the
//! durable write, so readers never observe a half-applied change.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    alerts::{self, AlertRecord, ResolutionLedger},
    clock::Clock,
    db::{
        history_key,
        models::{OptimalRange, Quantity, Reading, Sensor},
        KvStore, StoreError, LEDGER_KEY, SENSORS_KEY,
    },
    error::{EngineError, EngineResult},
    history::{HistoryStore, RETENTION_DAYS},
    power::{PowerPhase, PowerState, CHARGE_MEAN_HOURS},
    registry::{Registry, SensorConfig, SensorPatch},
    synth::{next_value, RandomSource, StepDraw},
};

/// Tunables of the simulation.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    /// Hours for a full 100 → 0 depletion.
    pub full_depletion_hours: f64,
    /// A paired sensor silent for longer than this is reported offline.
    pub offline_after: Duration,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            full_depletion_hours: 336.0,
            offline_after: Duration::minutes(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Unpaired,
    Online,
    Offline,
}

/// Registry record joined with its power state and newest reading.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SensorView {
    #[serde(flatten)]
    pub sensor: Sensor,
    pub status: SensorStatus,
    pub battery_level: Option<f64>,
    pub power_phase: Option<PowerPhase>,
    pub latest_reading: Option<Reading>,
}

/// Outcome of one generation pass over the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct TickReport {
    pub generated: usize,
    pub skipped_charging: usize,
    pub failed: usize,
    pub open_alerts: usize,
}

enum Outcome {
    Generated,
    Charging,
    Vanished,
}

struct EngineState {
    registry: Registry,
    power: HashMap<String, PowerState>,
    history: HistoryStore,
    ledger: ResolutionLedger,
    alerts: Vec<AlertRecord>,
    rng: Box<dyn RandomSource>,
}

pub struct Engine {
    state: Mutex<EngineState>,
    /// Writes that failed, latest value per key; `None` means delete.
    pending: Mutex<HashMap<String, Option<Value>>>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: SimulationSettings,
}

impl Engine {
    /// Build the engine from whatever the store holds.
    ///
    /// Power states are not persisted; they are rebuilt from each sensor's
    /// pairing time.
    pub async fn load(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        settings: SimulationSettings,
        rng: Box<dyn RandomSource>,
    ) -> EngineResult<Self> {
        let now = clock.now();
        let sensors: Vec<Sensor> = read_record(store.as_ref(), SENSORS_KEY).await?.unwrap_or_default();
        let ledger: ResolutionLedger = read_record(store.as_ref(), LEDGER_KEY).await?.unwrap_or_default();

        let registry = Registry::from_snapshot(sensors);
        let mut history = HistoryStore::new();
        let mut power = HashMap::new();
        for sensor in registry.paired() {
            let readings: Vec<Reading> = read_record(store.as_ref(), &history_key(&sensor.id))
                .await?
                .unwrap_or_default();
            history.restore(&sensor.id, readings);

            let paired_at = sensor.paired_at.unwrap_or(sensor.created_at);
            power.insert(
                sensor.id.clone(),
                PowerState::reconstruct(paired_at, now, settings.full_depletion_hours, CHARGE_MEAN_HOURS),
            );
        }

        let mut state = EngineState {
            registry,
            power,
            history,
            ledger,
            alerts: Vec::new(),
            rng,
        };
        refresh_alerts(&mut state, now);
        info!(
            sensors = state.registry.snapshot().len(),
            paired = state.power.len(),
            resolutions = state.ledger.len(),
            "Engine state loaded"
        );

        Ok(Self {
            state: Mutex::new(state),
            pending: Mutex::new(HashMap::new()),
            store,
            clock,
            settings,
        })
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Registry mutators
    // -----------------------------------------------------------------------

    pub async fn add_sensor(&self, config: SensorConfig) -> EngineResult<Sensor> {
        let mut state = self.state.lock().await;
        let sensor = state.registry.add(config, self.clock.now())?;
        info!(sensor_id = %sensor.id, "Sensor registered");

        self.write(SENSORS_KEY, Some(to_record(state.registry.snapshot())?)).await?;
        Ok(sensor)
    }

    pub async fn pair_sensor(&self, temp_id: &str, code: &str) -> EngineResult<Sensor> {
        self.pair_sensor_at(temp_id, code, self.clock.now()).await
    }

    /// Pair as of `paired_at`, which may lie in the past; the power state is
    /// then reconstructed rather than started fresh.
    async fn pair_sensor_at(
        &self,
        temp_id: &str,
        code: &str,
        paired_at: DateTime<Utc>,
    ) -> EngineResult<Sensor> {
        let now = self.clock.now();
        let hours = self.settings.full_depletion_hours;
        let mut state = self.state.lock().await;

        let sensor = state.registry.pair(temp_id, code, paired_at)?;
        let power = if paired_at < now {
            PowerState::reconstruct(paired_at, now, hours, CHARGE_MEAN_HOURS)
        } else {
            PowerState::new(now, hours, state.rng.as_mut())
        };
        state.power.insert(sensor.id.clone(), power);
        state.history.init(&sensor.id);
        info!(temp_id = %temp_id, sensor_id = %sensor.id, "Sensor paired");

        let sensors = to_record(state.registry.snapshot())?;
        let series = to_record(state.history.series(&sensor.id))?;
        self.write_all(vec![
            (SENSORS_KEY.to_owned(), Some(sensors)),
            (history_key(&sensor.id), Some(series)),
        ])
        .await?;
        Ok(sensor)
    }

    pub async fn update_config(&self, id: &str, patch: SensorPatch) -> EngineResult<Sensor> {
        let mut state = self.state.lock().await;
        let sensor = state.registry.update_config(id, patch)?;
        refresh_alerts(&mut state, self.clock.now());
        info!(sensor_id = %sensor.id, "Sensor configuration updated");

        self.write(SENSORS_KEY, Some(to_record(state.registry.snapshot())?)).await?;
        Ok(sensor)
    }

    /// Remove a sensor together with its power state, history and alert
    /// resolutions.
    pub async fn delete_sensor(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let sensor = state.registry.remove(id)?;
        state.power.remove(&sensor.id);
        state.history.remove(&sensor.id);
        state.alerts.retain(|a| a.sensor_id != sensor.id);
        let forgot_resolutions = state.ledger.forget_sensor(&sensor.id);
        info!(sensor_id = %sensor.id, "Sensor deleted");

        let mut writes = vec![(SENSORS_KEY.to_owned(), Some(to_record(state.registry.snapshot())?))];
        if sensor.paired {
            writes.push((history_key(&sensor.id), None));
        }
        if forgot_resolutions {
            writes.push((LEDGER_KEY.to_owned(), Some(to_record(&state.ledger)?)));
        }
        self.write_all(writes).await
    }

    // -----------------------------------------------------------------------
    // Read accessors
    // -----------------------------------------------------------------------

    pub async fn list_sensors_with_current_data(&self) -> Vec<SensorView> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .registry
            .snapshot()
            .iter()
            .map(|sensor| {
                let power = state.power.get(&sensor.id);
                let latest = state.history.latest(&sensor.id);
                let observed = power.map(|p| p.observe(now));
                SensorView {
                    status: derive_status(sensor, power, latest, now, self.settings.offline_after),
                    battery_level: observed.map(|(_, level)| level),
                    power_phase: observed.map(|(phase, _)| phase),
                    latest_reading: latest.cloned(),
                    sensor: sensor.clone(),
                }
            })
            .collect()
    }

    pub async fn get_sensor(&self, id: &str) -> EngineResult<Sensor> {
        let state = self.state.lock().await;
        state
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::sensor_not_found(id))
    }

    /// Readings of the last `days` days. Unknown ids yield an empty series.
    pub async fn get_history(&self, sensor_id: &str, days: i64) -> Vec<Reading> {
        let now = self.clock.now();
        self.state.lock().await.history.query(sensor_id, days, now)
    }

    /// Current battery level of a paired sensor.
    pub async fn current_level(&self, sensor_id: &str) -> EngineResult<f64> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .power
            .get(sensor_id)
            .map(|p| p.current_level(now))
            .ok_or_else(|| EngineError::sensor_not_found(sensor_id))
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    /// Re-evaluate every rule and return the live alert list.
    pub async fn get_alerts(&self) -> Vec<AlertRecord> {
        let mut state = self.state.lock().await;
        refresh_alerts(&mut state, self.clock.now());
        state.alerts.clone()
    }

    pub async fn resolve_alert(&self, alert_id: Uuid) -> EngineResult<AlertRecord> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        refresh_alerts(&mut state, now);

        let idx = state
            .alerts
            .iter()
            .position(|a| a.id == alert_id)
            .ok_or_else(|| EngineError::alert_not_found(alert_id.to_string()))?;
        let key = state.alerts[idx].dedup_key.clone();
        state.ledger.mark_resolved(&key, now);

        let alert = &mut state.alerts[idx];
        alert.resolved = true;
        alert.resolved_at = Some(now);
        let alert = alert.clone();
        info!(alert_id = %alert_id, dedup_key = %key, "Alert resolved");

        self.write(LEDGER_KEY, Some(to_record(&state.ledger)?)).await?;
        Ok(alert)
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Generate one reading for every paired sensor that is not charging,
    /// re-evaluate alerts and persist the touched series.
    ///
    /// A failing sensor is logged and skipped; a sensor deleted while the pass
    /// runs is silently skipped.
    pub async fn generate_now(&self) -> TickReport {
        if let Err(e) = self.flush_pending().await {
            warn!(error = %e, "Pending writes still failing");
        }

        let now = self.clock.now();
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state.registry.paired().map(|s| s.id.clone()).collect()
        };

        let mut report = TickReport::default();
        let mut touched = Vec::new();
        for id in ids {
            let mut state = self.state.lock().await;
            match generate_one(&mut state, &id, now) {
                Ok(Outcome::Generated) => {
                    report.generated += 1;
                    touched.push(id);
                }
                Ok(Outcome::Charging) => {
                    debug!(sensor_id = %id, "Sensor charging; no reading");
                    report.skipped_charging += 1;
                }
                Ok(Outcome::Vanished) => debug!(sensor_id = %id, "Sensor removed mid-tick; skipping"),
                Err(e) => {
                    warn!(sensor_id = %id, error = %e, "Reading generation failed; skipping sensor");
                    report.failed += 1;
                }
            }
        }

        let mut state = self.state.lock().await;
        refresh_alerts(&mut state, now);
        report.open_alerts = state.alerts.iter().filter(|a| !a.resolved).count();

        let mut writes = Vec::with_capacity(touched.len());
        for id in &touched {
            if !state.history.contains(id) {
                continue;
            }
            match to_record(state.history.series(id)) {
                Ok(v) => writes.push((history_key(id), Some(v))),
                Err(e) => error!(sensor_id = %id, error = %e, "Failed to serialize history"),
            }
        }
        if let Err(e) = self.write_all(writes).await {
            error!(error = %e, "Tick results not fully persisted");
        }

        info!(
            generated = report.generated,
            charging = report.skipped_charging,
            failed = report.failed,
            open_alerts = report.open_alerts,
            "Generation pass complete"
        );
        report
    }

    /// Fill an empty series with hourly readings from
    /// `max(paired_at, now - 30 days)` up to now.
    pub async fn backfill_history(&self, sensor_id: &str) -> EngineResult<usize> {
        let now = self.clock.now();
        let hours = self.settings.full_depletion_hours;
        let mut state = self.state.lock().await;

        let sensor = state
            .registry
            .get(sensor_id)
            .cloned()
            .ok_or_else(|| EngineError::sensor_not_found(sensor_id))?;
        let Some(paired_at) = sensor.paired_at.filter(|_| sensor.paired) else {
            return Err(EngineError::InvalidConfig(format!("sensor {sensor_id} is not paired")));
        };
        if !state.history.is_empty_for(&sensor.id) {
            return Ok(0);
        }

        let EngineState { history, rng, .. } = &mut *state;
        let mut at = paired_at.max(now - Duration::days(RETENTION_DAYS));
        let mut previous: Option<Reading> = None;
        let mut count = 0;
        while at <= now {
            let power = PowerState::reconstruct(paired_at, at, hours, CHARGE_MEAN_HOURS);
            if power.phase == PowerPhase::Depleting {
                let reading = synthesize(&sensor, previous.as_ref(), at, power.level, rng.as_mut())?;
                history.append(&sensor.id, reading.clone(), now);
                previous = Some(reading);
                count += 1;
            }
            at += Duration::hours(1);
        }
        refresh_alerts(&mut state, now);
        info!(sensor_id = %sensor.id, readings = count, "History backfilled");

        self.write(&history_key(&sensor.id), Some(to_record(state.history.series(&sensor.id))?))
            .await?;
        Ok(count)
    }

    /// Register, pair and backfill a small demo fleet when the registry is
    /// empty. Returns the number of sensors created.
    pub async fn seed_demo_fleet(&self) -> EngineResult<usize> {
        if !self.state.lock().await.registry.is_empty() {
            return Ok(0);
        }
        let paired_at = self.clock.now() - Duration::days(RETENTION_DAYS);

        let mut created = 0;
        for (n, config) in demo_fleet().into_iter().enumerate() {
            let sensor = self.add_sensor(config).await?;
            let sensor = self
                .pair_sensor_at(&sensor.temp_id, &format!("DEMO-QR-{}", n + 1), paired_at)
                .await?;
            self.backfill_history(&sensor.id).await?;
            created += 1;
        }
        info!(sensors = created, "Demo fleet seeded");
        Ok(created)
    }

    // -----------------------------------------------------------------------
    // Durability
    // -----------------------------------------------------------------------

    /// Retry every queued write. Errors if anything is still pending afterwards.
    pub async fn flush_pending(&self) -> EngineResult<()> {
        let _state = self.state.lock().await;
        let queued: Vec<_> = self.pending.lock().await.drain().collect();
        if queued.is_empty() {
            return Ok(());
        }
        info!(writes = queued.len(), "Retrying pending durable writes");

        let mut last_err = None;
        for (key, value) in queued {
            if let Err(e) = self.write(&key, value).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn pending_writes(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn write(&self, key: &str, value: Option<Value>) -> EngineResult<()> {
        let result = match &value {
            Some(v) => self.store.put(key, v.clone()).await,
            None => self.store.delete(key).await,
        };
        match result {
            Ok(()) => {
                self.pending.lock().await.remove(key);
                Ok(())
            }
            Err(e) => {
                error!(key = %key, error = %e, "Durable write failed; queued for retry");
                self.pending.lock().await.insert(key.to_owned(), value);
                Err(e.into())
            }
        }
    }

    /// Attempt every write; report the first failure.
    async fn write_all(&self, writes: Vec<(String, Option<Value>)>) -> EngineResult<()> {
        let mut first_err = None;
        for (key, value) in writes {
            if let Err(e) = self.write(&key, value).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

fn generate_one(state: &mut EngineState, id: &str, now: DateTime<Utc>) -> EngineResult<Outcome> {
    let Some(sensor) = state.registry.get(id).filter(|s| s.paired && s.id == id).cloned() else {
        return Ok(Outcome::Vanished);
    };
    let EngineState { power, history, rng, .. } = state;

    let power_state = power.get_mut(id).ok_or_else(|| EngineError::CorruptState {
        sensor_id: id.to_owned(),
        reason: "missing power state".into(),
    })?;
    if !power_state.depletion_rate.is_finite() || power_state.depletion_rate <= 0.0 {
        return Err(EngineError::CorruptState {
            sensor_id: id.to_owned(),
            reason: format!("invalid depletion rate {}", power_state.depletion_rate),
        });
    }
    if power_state.advance(now, rng.as_mut()) == PowerPhase::Charging {
        return Ok(Outcome::Charging);
    }

    let reading = synthesize(&sensor, history.latest(id), now, power_state.level, rng.as_mut())?;
    debug!(
        sensor_id = %id,
        temperature = ?reading.temperature,
        moisture = ?reading.moisture,
        battery = reading.battery,
        "Reading generated"
    );
    history.append(id, reading, now);
    Ok(Outcome::Generated)
}

/// Next reading for every monitored quantity of `sensor`.
fn synthesize(
    sensor: &Sensor,
    previous: Option<&Reading>,
    at: DateTime<Utc>,
    battery: f64,
    rng: &mut dyn RandomSource,
) -> EngineResult<Reading> {
    let mut reading = Reading {
        timestamp: at,
        sensor_id: sensor.id.clone(),
        temperature: None,
        moisture: None,
        battery,
    };
    for q in sensor.quantities.iter() {
        let range = sensor.range(q).ok_or_else(|| EngineError::CorruptState {
            sensor_id: sensor.id.clone(),
            reason: format!("missing optimal range for {q}"),
        })?;
        let prev = previous.and_then(|r| r.value(q));
        reading.set_value(q, Some(next_value(q, prev, range, StepDraw::draw(rng))));
    }
    Ok(reading)
}

fn refresh_alerts(state: &mut EngineState, now: DateTime<Utc>) {
    let mut candidates = Vec::new();
    for sensor in state.registry.paired() {
        let Some(reading) = state.history.latest(&sensor.id) else {
            continue;
        };
        let charging = state.power.get(&sensor.id).is_some_and(|p| p.is_charging(now));
        candidates.extend(alerts::evaluate(sensor, reading, charging));
    }
    state.alerts = state.ledger.reconcile(candidates);
}

fn derive_status(
    sensor: &Sensor,
    power: Option<&PowerState>,
    latest: Option<&Reading>,
    now: DateTime<Utc>,
    offline_after: Duration,
) -> SensorStatus {
    if !sensor.paired {
        return SensorStatus::Unpaired;
    }
    if power.map_or(true, |p| p.is_charging(now)) {
        return SensorStatus::Offline;
    }
    let last_seen = latest
        .map(|r| r.timestamp)
        .or(sensor.paired_at)
        .unwrap_or(sensor.created_at);
    if now - last_seen > offline_after {
        SensorStatus::Offline
    } else {
        SensorStatus::Online
    }
}

fn demo_fleet() -> Vec<SensorConfig> {
    let temp = (Quantity::Temperature, OptimalRange::new(15.0, 25.0));
    let moist = (Quantity::Moisture, OptimalRange::new(12.0, 18.0));
    vec![
        SensorConfig {
            quantities: [Quantity::Temperature].into_iter().collect(),
            optimal_ranges: [temp].into_iter().collect(),
            bales_monitored: 120,
            location: "Hay barn A".into(),
            description: "Round bales, east wall".into(),
        },
        SensorConfig {
            quantities: [Quantity::Moisture].into_iter().collect(),
            optimal_ranges: [moist].into_iter().collect(),
            bales_monitored: 80,
            location: "Hay barn B".into(),
            description: "Square bales, loft".into(),
        },
        SensorConfig {
            quantities: [Quantity::Temperature, Quantity::Moisture].into_iter().collect(),
            optimal_ranges: [temp, moist].into_iter().collect(),
            bales_monitored: 200,
            location: "Field stack 3".into(),
            description: "Covered outdoor stack".into(),
        },
    ]
}

fn to_record<T: Serialize + ?Sized>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(|e| EngineError::Persistence(StoreError::from(e)))
}

async fn read_record<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> EngineResult<Option<T>> {
    match store.get(key).await? {
        Some(v) => Ok(Some(serde_json::from_value(v).map_err(StoreError::from)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use super::*;
    use crate::{
        alerts::{AlertRule, Severity},
        clock::ManualClock,
        db::{models::QuantitySet, MemoryStore},
        synth::SequenceRandom,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    struct Harness {
        engine: Engine,
        store: Arc<MemoryStore>,
        clock: ManualClock,
    }

    async fn harness_with(draws: Vec<f64>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(t0());
        let engine = Engine::load(
            store.clone(),
            Arc::new(clock.clone()),
            SimulationSettings::default(),
            Box::new(SequenceRandom::new(draws)),
        )
        .await
        .unwrap();
        Harness { engine, store, clock }
    }

    async fn harness() -> Harness {
        harness_with(vec![0.5]).await
    }

    fn temp_config(min: f64, max: f64) -> SensorConfig {
        SensorConfig {
            quantities: [Quantity::Temperature].into_iter().collect(),
            optimal_ranges: BTreeMap::from([(Quantity::Temperature, OptimalRange::new(min, max))]),
            bales_monitored: 30,
            location: "Barn".into(),
            description: String::new(),
        }
    }

    async fn paired_sensor(h: &Harness, min: f64, max: f64) -> Sensor {
        let s = h.engine.add_sensor(temp_config(min, max)).await.unwrap();
        h.engine.pair_sensor(&s.temp_id, "QR-X").await.unwrap()
    }

    #[tokio::test]
    async fn pairing_persists_registry_and_initializes_state() {
        let h = harness().await;
        let sensor = paired_sensor(&h, 18.0, 25.0).await;
        assert_eq!(sensor.id, "SENS-001");

        let stored = h.store.get(SENSORS_KEY).await.unwrap().unwrap();
        assert_eq!(stored[0]["id"], "SENS-001");
        assert_eq!(stored[0]["temp_id"], "TEMP-001");
        assert_eq!(h.store.get("history:SENS-001").await.unwrap(), Some(serde_json::json!([])));
        assert_eq!(h.engine.current_level("SENS-001").await.unwrap(), 100.0);

        let err = h.engine.pair_sensor("TEMP-001", "QR-X").await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyPaired(_)));
    }

    #[tokio::test]
    async fn generate_now_appends_one_reading_per_paired_sensor() {
        let h = harness().await;
        paired_sensor(&h, 18.0, 25.0).await;
        h.engine.add_sensor(temp_config(18.0, 25.0)).await.unwrap(); // unpaired

        h.clock.advance(Duration::minutes(30));
        let report = h.engine.generate_now().await;
        assert_eq!(report.generated, 1);
        assert_eq!(report.failed, 0);

        let history = h.engine.get_history("SENS-001", 1).await;
        assert_eq!(history.len(), 1);
        // first sample with a 0.5 draw sits exactly on the midpoint
        assert_eq!(history[0].temperature, Some(21.5));
        assert!(history[0].moisture.is_none());

        let persisted = h.store.get("history:SENS-001").await.unwrap().unwrap();
        assert_eq!(persisted.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn charging_sensor_produces_no_reading() {
        let h = harness().await;
        paired_sensor(&h, 18.0, 25.0).await;

        // 336 h full depletion → threshold after ~316 h
        h.clock.advance(Duration::hours(320));
        let report = h.engine.generate_now().await;
        assert_eq!(report.generated, 0);
        assert_eq!(report.skipped_charging, 1);

        let views = h.engine.list_sensors_with_current_data().await;
        assert_eq!(views[0].status, SensorStatus::Offline);
        assert_eq!(views[0].power_phase, Some(PowerPhase::Charging));
    }

    #[tokio::test]
    async fn alerts_for_hot_reading_and_stable_keys() {
        // draws: charge window, then (bias, magnitude) for the first sample
        let h = harness_with(vec![0.5, 0.0, 1.0]).await;
        paired_sensor(&h, 4.0, 5.0).await; // midpoint 4.5 ± 0.3 → 4.8
        h.clock.advance(Duration::minutes(30));
        h.engine.generate_now().await;

        // adjust the range so the stored reading is out of band
        let patch = SensorPatch {
            optimal_ranges: Some(BTreeMap::from([(Quantity::Temperature, OptimalRange::new(1.0, 2.0))])),
            ..Default::default()
        };
        h.engine.update_config("SENS-001", patch).await.unwrap();

        let first = h.engine.get_alerts().await;
        let second = h.engine.get_alerts().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].rule, AlertRule::Temperature);
        assert_eq!(first[0].severity, Severity::Warning);
        assert_eq!(
            first.iter().map(|a| &a.dedup_key).collect::<Vec<_>>(),
            second.iter().map(|a| &a.dedup_key).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn resolving_an_alert_survives_reevaluation_and_persists() {
        let h = harness_with(vec![0.5, 0.0, 1.0]).await;
        paired_sensor(&h, 4.0, 5.0).await;
        h.clock.advance(Duration::minutes(30));
        h.engine.generate_now().await;
        h.engine
            .update_config(
                "SENS-001",
                SensorPatch {
                    optimal_ranges: Some(BTreeMap::from([(Quantity::Temperature, OptimalRange::new(1.0, 2.0))])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let alert = h.engine.get_alerts().await.remove(0);
        let resolved = h.engine.resolve_alert(alert.id).await.unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_at, Some(h.clock.now()));

        let again = h.engine.get_alerts().await;
        assert!(again[0].resolved);

        let ledger = h.store.get(LEDGER_KEY).await.unwrap().unwrap();
        assert_eq!(ledger[&alert.dedup_key]["resolved"], true);
    }

    #[tokio::test]
    async fn reused_sensor_id_does_not_inherit_resolutions() {
        let h = harness_with(vec![0.5, 0.0, 1.0]).await;
        let hot_range = SensorPatch {
            optimal_ranges: Some(BTreeMap::from([(Quantity::Temperature, OptimalRange::new(1.0, 2.0))])),
            ..Default::default()
        };

        paired_sensor(&h, 4.0, 5.0).await;
        h.clock.advance(Duration::minutes(30));
        h.engine.generate_now().await;
        h.engine.update_config("SENS-001", hot_range.clone()).await.unwrap();
        let alert = h.engine.get_alerts().await.remove(0);
        h.engine.resolve_alert(alert.id).await.unwrap();

        h.engine.delete_sensor("SENS-001").await.unwrap();
        let ledger = h.store.get(LEDGER_KEY).await.unwrap().unwrap();
        assert_eq!(ledger, serde_json::json!({}));

        // highest id was freed, so the next pairing reuses it
        let reborn = paired_sensor(&h, 4.0, 5.0).await;
        assert_eq!(reborn.id, "SENS-001");
        h.clock.advance(Duration::minutes(30));
        h.engine.generate_now().await;
        h.engine.update_config("SENS-001", hot_range).await.unwrap();

        let alerts = h.engine.get_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].dedup_key, alert.dedup_key);
        assert!(!alerts[0].resolved);
        assert!(alerts[0].resolved_at.is_none());
    }

    #[tokio::test]
    async fn resolve_unknown_alert_is_not_found() {
        let h = harness().await;
        let err = h.engine.resolve_alert(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { what: "alert", .. }));
    }

    #[tokio::test]
    async fn delete_cascades_to_power_and_history() {
        let h = harness().await;
        paired_sensor(&h, 18.0, 25.0).await;
        h.clock.advance(Duration::minutes(30));
        h.engine.generate_now().await;

        h.engine.delete_sensor("SENS-001").await.unwrap();
        assert!(h.engine.get_history("SENS-001", 30).await.is_empty());
        assert!(h.engine.current_level("SENS-001").await.is_err());
        assert!(h.store.get("history:SENS-001").await.unwrap().is_none());
        assert!(h.engine.list_sensors_with_current_data().await.is_empty());

        let err = h.engine.delete_sensor("SENS-001").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn invalid_config_does_not_mutate_or_persist() {
        let h = harness().await;
        let err = h.engine.add_sensor(temp_config(25.0, 18.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert!(h.engine.list_sensors_with_current_data().await.is_empty());
        assert!(h.store.get(SENSORS_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistence_failure_keeps_memory_state_and_retries() {
        let h = harness().await;
        h.store.set_failing(true);

        let err = h.engine.add_sensor(temp_config(18.0, 25.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        // read-your-writes despite the failed durable write
        assert_eq!(h.engine.list_sensors_with_current_data().await.len(), 1);
        assert_eq!(h.engine.pending_writes().await, 1);
        assert!(h.engine.flush_pending().await.is_err());

        h.store.set_failing(false);
        h.engine.flush_pending().await.unwrap();
        assert_eq!(h.engine.pending_writes().await, 0);
        let stored = h.store.get(SENSORS_KEY).await.unwrap().unwrap();
        assert_eq!(stored.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_reflects_pairing_and_staleness() {
        let h = harness().await;
        h.engine.add_sensor(temp_config(18.0, 25.0)).await.unwrap();
        paired_sensor(&h, 18.0, 25.0).await;

        let views = h.engine.list_sensors_with_current_data().await;
        let unpaired = views.iter().find(|v| !v.sensor.paired).unwrap();
        let paired = views.iter().find(|v| v.sensor.paired).unwrap();
        assert_eq!(unpaired.status, SensorStatus::Unpaired);
        assert!(unpaired.battery_level.is_none());
        assert_eq!(paired.status, SensorStatus::Online);
        assert_eq!(paired.battery_level, Some(100.0));

        h.clock.advance(Duration::hours(3));
        let views = h.engine.list_sensors_with_current_data().await;
        let paired = views.iter().find(|v| v.sensor.paired).unwrap();
        assert_eq!(paired.status, SensorStatus::Offline);
    }

    #[tokio::test]
    async fn reload_restores_registry_history_and_ledger() {
        let h = harness().await;
        paired_sensor(&h, 18.0, 25.0).await;
        h.clock.advance(Duration::minutes(30));
        h.engine.generate_now().await;

        let reloaded = Engine::load(
            h.store.clone(),
            Arc::new(h.clock.clone()),
            SimulationSettings::default(),
            Box::new(SequenceRandom::new(vec![0.5])),
        )
        .await
        .unwrap();
        let views = reloaded.list_sensors_with_current_data().await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].sensor.id, "SENS-001");
        assert!(views[0].latest_reading.is_some());
        assert_eq!(reloaded.get_history("SENS-001", 1).await.len(), 1);
    }

    #[tokio::test]
    async fn backfill_fills_empty_series_once() {
        let h = harness().await;
        let s = h.engine.add_sensor(temp_config(18.0, 25.0)).await.unwrap();
        h.engine
            .pair_sensor_at(&s.temp_id, "QR", t0() - Duration::hours(48))
            .await
            .unwrap();

        let n = h.engine.backfill_history("SENS-001").await.unwrap();
        assert_eq!(n, 49);
        let series = h.engine.get_history("SENS-001", 30).await;
        assert_eq!(series.len(), 49);
        assert!(series.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(series[0].battery, 100.0);

        assert_eq!(h.engine.backfill_history("SENS-001").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn backfill_unpaired_is_rejected() {
        let h = harness().await;
        h.engine.add_sensor(temp_config(18.0, 25.0)).await.unwrap();
        assert!(matches!(
            h.engine.backfill_history("TEMP-001").await,
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn demo_fleet_is_seeded_only_into_empty_registry() {
        let h = harness_with(vec![0.3, 0.7, 0.5]).await;
        assert_eq!(h.engine.seed_demo_fleet().await.unwrap(), 3);
        assert_eq!(h.engine.seed_demo_fleet().await.unwrap(), 0);

        let views = h.engine.list_sensors_with_current_data().await;
        assert_eq!(views.len(), 3);
        assert!(views.iter().all(|v| v.sensor.paired));
        assert_eq!(views[2].sensor.quantities, QuantitySet::all());
        for v in &views {
            assert!(!h.engine.get_history(&v.sensor.id, 30).await.is_empty());
        }
    }

    #[tokio::test]
    async fn missing_power_state_is_skipped_not_fatal() {
        let h = harness().await;
        paired_sensor(&h, 18.0, 25.0).await;
        let s2 = h.engine.add_sensor(temp_config(18.0, 25.0)).await.unwrap();
        h.engine.pair_sensor(&s2.temp_id, "QR-2").await.unwrap();

        h.engine.state.lock().await.power.remove("SENS-001");
        h.clock.advance(Duration::minutes(30));
        let report = h.engine.generate_now().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.generated, 1);
        assert_eq!(h.engine.get_history("SENS-002", 1).await.len(), 1);
    }
}
