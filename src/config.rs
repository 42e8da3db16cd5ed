use std::time::Duration;

use anyhow::{ensure, Context, Result};

use crate::engine::SimulationSettings;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL of the durable store. `None` keeps state in memory only.
    pub database_url: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    /// Scheduler re-arm window in minutes.
    pub tick_min_minutes: u64,
    pub tick_max_minutes: u64,
    /// Hours for a full battery depletion.
    pub full_depletion_hours: f64,
    /// Paired sensors silent for longer than this are reported offline.
    pub offline_after_minutes: i64,
    /// Retry period for durable writes that failed.
    pub persist_retry_secs: u64,
    /// Fixed seed for reproducible simulation runs.
    pub rng_seed: Option<u64>,
    /// Seed a demo fleet with backfilled history into an empty registry.
    pub seed_demo_fleet: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            tick_min_minutes: optional("TICK_MIN_MINUTES", "30")
                .parse()
                .context("TICK_MIN_MINUTES must be a positive integer")?,
            tick_max_minutes: optional("TICK_MAX_MINUTES", "45")
                .parse()
                .context("TICK_MAX_MINUTES must be a positive integer")?,
            full_depletion_hours: optional("FULL_DEPLETION_HOURS", "336")
                .parse()
                .context("FULL_DEPLETION_HOURS must be a positive number")?,
            offline_after_minutes: optional("OFFLINE_AFTER_MINUTES", "120")
                .parse()
                .context("OFFLINE_AFTER_MINUTES must be a positive integer")?,
            persist_retry_secs: optional("PERSIST_RETRY_SECS", "30")
                .parse()
                .context("PERSIST_RETRY_SECS must be a positive integer")?,
            rng_seed: std::env::var("RNG_SEED")
                .ok()
                .map(|s| s.parse().context("RNG_SEED must be an unsigned integer"))
                .transpose()?,
            seed_demo_fleet: parse_bool(&optional("SEED_DEMO_FLEET", "false"))
                .context("SEED_DEMO_FLEET must be true or false")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.tick_min_minutes > 0, "TICK_MIN_MINUTES must be greater than zero");
        ensure!(
            self.tick_min_minutes <= self.tick_max_minutes,
            "TICK_MIN_MINUTES ({}) must not exceed TICK_MAX_MINUTES ({})",
            self.tick_min_minutes,
            self.tick_max_minutes
        );
        ensure!(
            self.full_depletion_hours.is_finite() && self.full_depletion_hours > 0.0,
            "FULL_DEPLETION_HOURS must be greater than zero"
        );
        ensure!(self.offline_after_minutes > 0, "OFFLINE_AFTER_MINUTES must be greater than zero");
        ensure!(self.persist_retry_secs > 0, "PERSIST_RETRY_SECS must be greater than zero");
        Ok(())
    }

    pub fn tick_window(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.tick_min_minutes * 60),
            Duration::from_secs(self.tick_max_minutes * 60),
        )
    }

    pub fn simulation(&self) -> SimulationSettings {
        SimulationSettings {
            full_depletion_hours: self.full_depletion_hours,
            offline_after: chrono::Duration::minutes(self.offline_after_minutes),
        }
    }
}

/// Accepts `true/false`, `1/0`, `yes/no` (case-insensitive).
fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(anyhow::anyhow!("not a boolean: {other:?}")),
    }
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            database_url: None,
            server_host: "0.0.0.0".into(),
            server_port: 8080,
            tick_min_minutes: 30,
            tick_max_minutes: 45,
            full_depletion_hours: 336.0,
            offline_after_minutes: 120,
            persist_retry_secs: 30,
            rng_seed: None,
            seed_demo_fleet: false,
        }
    }

    #[test]
    fn defaults_validate() {
        base().validate().unwrap();
    }

    #[test]
    fn inverted_tick_window_errors() {
        let cfg = Config { tick_min_minutes: 50, ..base() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn zero_depletion_hours_errors() {
        let cfg = Config { full_depletion_hours: 0.0, ..base() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tick_window_in_seconds() {
        let (min, max) = base().tick_window();
        assert_eq!(min, Duration::from_secs(1800));
        assert_eq!(max, Duration::from_secs(2700));
    }

    #[test]
    fn simulation_settings_follow_config() {
        let s = Config { full_depletion_hours: 100.0, offline_after_minutes: 15, ..base() }.simulation();
        assert_eq!(s.full_depletion_hours, 100.0);
        assert_eq!(s.offline_after, chrono::Duration::minutes(15));
    }

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("no").unwrap());
        assert!(!parse_bool("").unwrap());
        let err = parse_bool("maybe").unwrap_err();
        assert!(err.to_string().contains("not a boolean"));
    }
}
