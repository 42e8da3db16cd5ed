use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use farm_telemetry::{
    api,
    clock::SystemClock,
    config::Config,
    db::{self, KvStore, MemoryStore, PgStore},
    engine::Engine,
    scheduler::{spawn_persistence_retry, Scheduler},
    synth::{RandomSource, SeededRandom},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent; env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn KvStore> = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;
            db::run_migrations(&pool).await?;
            info!("Database ready");
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; state is kept in memory and lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(
        Engine::load(store, Arc::new(SystemClock), config.simulation(), random_source(config.rng_seed, 0))
            .await?,
    );

    if config.seed_demo_fleet {
        engine.seed_demo_fleet().await?;
    }
    for view in engine.list_sensors_with_current_data().await {
        if !view.sensor.paired || view.latest_reading.is_some() {
            continue;
        }
        if let Err(e) = engine.backfill_history(&view.sensor.id).await {
            warn!(sensor_id = %view.sensor.id, error = %e, "History backfill failed");
        }
    }

    let (min, max) = config.tick_window();
    let scheduler = Scheduler::new(engine.clone(), min, max, random_source(config.rng_seed, 1));
    scheduler.start();

    let retry = spawn_persistence_retry(engine.clone(), Duration::from_secs(config.persist_retry_secs));

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, api::router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop();
    retry.abort();
    if let Err(e) = engine.flush_pending().await {
        warn!(pending = engine.pending_writes().await, error = %e, "Exiting with unpersisted writes");
    }

    Ok(())
}

/// Independent stream per consumer; derived from `seed` when one is set.
fn random_source(seed: Option<u64>, stream: u64) -> Box<dyn RandomSource> {
    match seed {
        Some(seed) => Box::new(SeededRandom::from_seed(seed.wrapping_add(stream))),
        None => Box::new(SeededRandom::from_entropy()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
