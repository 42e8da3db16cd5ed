use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{task::JoinHandle, time};
use tracing::{info, warn};

use crate::{
    engine::{Engine, TickReport},
    synth::RandomSource,
};

/// Drives periodic generation passes.
///
/// At most one timer is active: `start` replaces any running loop. After every
/// pass the timer re-arms with a fresh delay drawn uniformly from
/// `[min_interval, max_interval]`.
pub struct Scheduler {
    engine: Arc<Engine>,
    min_interval: Duration,
    max_interval: Duration,
    rng: Arc<Mutex<Box<dyn RandomSource>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<Engine>,
        min_interval: Duration,
        max_interval: Duration,
        rng: Box<dyn RandomSource>,
    ) -> Self {
        Self {
            engine,
            min_interval,
            max_interval,
            rng: Arc::new(Mutex::new(rng)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the generation loop, aborting a previously started one.
    pub fn start(&self) {
        let engine = self.engine.clone();
        let rng = self.rng.clone();
        let (min, max) = (self.min_interval, self.max_interval);

        let task = tokio::spawn(async move {
            info!(min_secs = min.as_secs(), max_secs = max.as_secs(), "Generation scheduler started");
            loop {
                let delay = {
                    let mut rng = rng.lock().unwrap_or_else(|p| p.into_inner());
                    next_delay(rng.as_mut(), min, max)
                };
                info!(delay_secs = delay.as_secs(), "Next generation pass scheduled");
                time::sleep(delay).await;
                engine.generate_now().await;
            }
        });

        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = handle.replace(task) {
            warn!("Scheduler restarted; aborting previous timer");
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
            info!("Generation scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Run a pass immediately. The pending timer is left untouched.
    pub async fn generate_now(&self) -> TickReport {
        self.engine.generate_now().await
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Uniform delay in `[min, max]`.
pub fn next_delay(rng: &mut dyn RandomSource, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_secs_f64();
    min + Duration::from_secs_f64(span * rng.next_unit())
}

/// Periodically retry durable writes that failed earlier.
pub fn spawn_persistence_retry(engine: Arc<Engine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if engine.pending_writes().await == 0 {
                continue;
            }
            if let Err(e) = engine.flush_pending().await {
                warn!(error = %e, "Durable write retry failed");
            }
        }
    })
}
