//! Battery lifecycle: linear depletion, then a randomized charge window.
//!
//! State is advanced lazily. [`PowerState::observe`] derives phase and level
//! purely from the stored phase start and `now`; [`PowerState::advance`]
//! commits whatever transition `observe` reports.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::synth::RandomSource;

pub const FULL_LEVEL: f64 = 100.0;
/// Depletion to this level or below starts a charge cycle.
pub const CHARGE_THRESHOLD: f64 = 6.0;
/// Lowest level ever reported.
pub const LEVEL_FLOOR: f64 = 2.0;
pub const CHARGE_MIN_HOURS: f64 = 5.0;
pub const CHARGE_MAX_HOURS: f64 = 7.0;
/// Charge window assumed when rebuilding state for past cycles.
pub const CHARGE_MEAN_HOURS: f64 = (CHARGE_MIN_HOURS + CHARGE_MAX_HOURS) / 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PowerPhase {
    Depleting,
    Charging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    /// Level as of the last `advance`.
    pub level: f64,
    pub phase: PowerPhase,
    pub phase_started_at: DateTime<Utc>,
    /// Charge window of the current cycle, drawn on entering `Charging`.
    pub charge_hours: f64,
    /// Percent per hour.
    pub depletion_rate: f64,
    pub last_charged_at: Option<DateTime<Utc>>,
}

impl PowerState {
    /// Fully charged battery starting to deplete at `now`.
    pub fn new(now: DateTime<Utc>, full_depletion_hours: f64, rng: &mut dyn RandomSource) -> Self {
        Self {
            level: FULL_LEVEL,
            phase: PowerPhase::Depleting,
            phase_started_at: now,
            charge_hours: draw_charge_hours(rng),
            depletion_rate: FULL_LEVEL / full_depletion_hours,
            last_charged_at: None,
        }
    }

    /// Rebuild the state that applied at `at` for a sensor paired at
    /// `paired_at`, treating depletion plus charge as one repeating cycle.
    pub fn reconstruct(
        paired_at: DateTime<Utc>,
        at: DateTime<Utc>,
        full_depletion_hours: f64,
        charge_hours: f64,
    ) -> Self {
        let fresh = Self {
            level: FULL_LEVEL,
            phase: PowerPhase::Depleting,
            phase_started_at: paired_at,
            charge_hours,
            depletion_rate: FULL_LEVEL / full_depletion_hours,
            last_charged_at: None,
        };
        fresh.settle(at)
    }

    /// The state that applies at `now`, folding every phase boundary crossed
    /// since `phase_started_at`. Transitions are anchored where they happened,
    /// not where they are observed. Future cycles reuse `charge_hours`.
    fn settle(&self, now: DateTime<Utc>) -> Self {
        let rate = self.depletion_rate;
        if !rate.is_finite() || rate <= 0.0 {
            return self.clone();
        }
        let deplete_span = (FULL_LEVEL - CHARGE_THRESHOLD) / rate;
        let cycle = deplete_span + self.charge_hours;

        // Charging states are placed on a virtual cycle that began one
        // depletion span before the charge did.
        let (cycle_start, min_elapsed) = match self.phase {
            PowerPhase::Depleting => (self.phase_started_at, 0.0),
            PowerPhase::Charging => (self.phase_started_at - hours(deplete_span), deplete_span),
        };
        let elapsed = hours_between(cycle_start, now).max(min_elapsed);
        let cycles = (elapsed / cycle).floor();
        let into_cycle = elapsed - cycles * cycle;
        let start = if cycles > 0.0 {
            cycle_start + hours(cycles * cycle)
        } else {
            cycle_start
        };
        let last_charged_at = if cycles > 0.0 { Some(start) } else { self.last_charged_at };

        if into_cycle < deplete_span {
            Self {
                level: (FULL_LEVEL - rate * into_cycle).clamp(LEVEL_FLOOR, FULL_LEVEL),
                phase: PowerPhase::Depleting,
                phase_started_at: start,
                last_charged_at,
                ..self.clone()
            }
        } else {
            let charge_start = start + hours(deplete_span);
            Self {
                level: charging_display_level(charge_start, now),
                phase: PowerPhase::Charging,
                phase_started_at: charge_start,
                last_charged_at,
                ..self.clone()
            }
        }
    }

    /// Phase and level at `now`, without mutating anything.
    pub fn observe(&self, now: DateTime<Utc>) -> (PowerPhase, f64) {
        let settled = self.settle(now);
        (settled.phase, settled.level)
    }

    /// Level at `now`. Calling it repeatedly with the same `now` yields the same value.
    pub fn current_level(&self, now: DateTime<Utc>) -> f64 {
        self.observe(now).1
    }

    pub fn is_charging(&self, now: DateTime<Utc>) -> bool {
        self.observe(now).0 == PowerPhase::Charging
    }

    /// Commit every transition that applies at `now`.
    ///
    /// Entering a new depletion phase draws the window of the charge that
    /// will end it. Re-running with the same `now` is a no-op.
    pub fn advance(&mut self, now: DateTime<Utc>, rng: &mut dyn RandomSource) -> PowerPhase {
        let next = self.settle(now);
        let new_cycle = next.phase == PowerPhase::Depleting && next.phase_started_at != self.phase_started_at;
        *self = next;
        if new_cycle {
            self.charge_hours = draw_charge_hours(rng);
        }
        self.phase
    }
}

fn draw_charge_hours(rng: &mut dyn RandomSource) -> f64 {
    rng.next_between(CHARGE_MIN_HOURS, CHARGE_MAX_HOURS)
}

/// Volatile low value in `[2, 6)` shown while charging.
///
/// Derived by hashing the two instants so it is stable for a given `now`.
fn charging_display_level(phase_start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let seed = (phase_start.timestamp_millis() as u64).rotate_left(32) ^ now.timestamp_millis() as u64;
    let unit = (splitmix64(seed) >> 11) as f64 / (1u64 << 53) as f64;
    LEVEL_FLOOR + unit * (CHARGE_THRESHOLD - LEVEL_FLOOR)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

pub(crate) fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

pub(crate) fn hours(h: f64) -> Duration {
    Duration::milliseconds((h * 3_600_000.0).round() as i64)
}
