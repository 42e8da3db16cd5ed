//! Bounded, mean-reverting random walk per monitored quantity.
//!
//! The walk itself is the pure function [`next_value`]; randomness enters only
//! through a [`StepDraw`], so tests can pin exact outputs.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::db::models::{OptimalRange, Quantity};

/// Maximum step as a fraction of the previous value's magnitude.
const STEP_FRACTION: f64 = 0.15;
/// Span of the first-sample perturbation as a fraction of the range width.
const FIRST_SAMPLE_SPREAD: f64 = 0.6;
/// Magnitude floor so a walk sitting at zero can still move.
const MIN_STEP_BASE: f64 = 1.0;

/// Uniform pseudorandom draws in `[0, 1)`.
pub trait RandomSource: Send {
    fn next_unit(&mut self) -> f64;

    /// Uniform draw in `[lo, hi)`.
    fn next_between(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_unit()
    }
}

/// `StdRng`-backed source; seeded for reproducible runs.
#[derive(Debug)]
pub struct SeededRandom(StdRng);

impl SeededRandom {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    pub fn from_seed(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RandomSource for SeededRandom {
    fn next_unit(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
}

/// Replays a fixed list of draws, wrapping around at the end.
#[derive(Debug, Clone)]
pub struct SequenceRandom {
    values: Vec<f64>,
    pos: usize,
}

impl SequenceRandom {
    pub fn new(values: Vec<f64>) -> Self {
        assert!(!values.is_empty(), "SequenceRandom needs at least one value");
        Self { values, pos: 0 }
    }
}

impl RandomSource for SequenceRandom {
    fn next_unit(&mut self) -> f64 {
        let v = self.values[self.pos % self.values.len()];
        self.pos += 1;
        v
    }
}

/// The two draws consumed by one synthesis step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDraw {
    /// Decides between reverting toward the range and an excursion.
    pub bias: f64,
    /// Step size as a fraction of the maximum step (or the first-sample offset).
    pub magnitude: f64,
}

impl StepDraw {
    pub fn draw(rng: &mut dyn RandomSource) -> Self {
        let bias = rng.next_unit();
        let magnitude = rng.next_unit();
        Self { bias, magnitude }
    }
}

/// Probability that a step reverts toward (or wanders within) the range.
pub fn revert_probability(q: Quantity) -> f64 {
    match q {
        Quantity::Temperature => 0.80,
        Quantity::Moisture => 0.85,
    }
}

/// Physical bounds: everything is floored at zero, moisture is capped at 100.
pub fn clamp_physical(q: Quantity, v: f64) -> f64 {
    match q {
        Quantity::Temperature => v.max(0.0),
        Quantity::Moisture => v.clamp(0.0, 100.0),
    }
}

/// Next sample for `q` given the previous sample and the optimal range.
pub fn next_value(q: Quantity, previous: Option<f64>, range: OptimalRange, draw: StepDraw) -> f64 {
    let Some(prev) = previous else {
        let offset = (draw.magnitude - 0.5) * FIRST_SAMPLE_SPREAD * range.width();
        return clamp_physical(q, range.midpoint() + offset);
    };

    let max_step = STEP_FRACTION * prev.abs().max(MIN_STEP_BASE);
    let next = if draw.bias < revert_probability(q) {
        if range.contains(prev) {
            prev + (draw.magnitude - 0.5) * max_step
        } else if prev < range.min {
            prev + draw.magnitude * max_step
        } else {
            prev - draw.magnitude * max_step
        }
    } else if prev >= range.midpoint() {
        prev + draw.magnitude * max_step
    } else {
        prev - draw.magnitude * max_step
    };

    clamp_physical(q, next)
}
