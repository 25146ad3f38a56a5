//! Daily reminder scheduler.
//!
//! Runs the T-15/T-7/T-0 reminder job once a day at `CRON_TIME` (local time,
//! set `TZ` for the zone). `RUN_ON_START=1` also runs it right away and
//! `DRY_RUN=1` skips the actual sends.

use chrono::Local;
use tokio::time::sleep;

use noa_cobros::config::WorkerConfig;
use noa_cobros::logging::init_logging;
use noa_cobros::worker::{next_run_after, run_job, HttpBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env()?;
    let _guard = init_logging("noa-worker", &config.log_dir);

    if config.username.is_none() || config.password.is_none() {
        tracing::warn!("WORKER_USERNAME / WORKER_PASSWORD not set, requests go out unauthenticated");
    }
    let backend = HttpBackend::new(&config)?;

    tracing::info!(
        at = %config.run_at.format("%H:%M"),
        waves = ?config.waves,
        "reminder scheduler started"
    );

    if config.run_on_start {
        run_job(&backend, &config, Local::now().date_naive()).await;
    }

    loop {
        let now = Local::now().naive_local();
        let next = next_run_after(now, config.run_at);
        let wait = (next - now).to_std().unwrap_or_default();
        tracing::info!(next_run = %next, "sleeping until next run");

        tokio::select! {
            _ = sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                return Ok(());
            }
        }

        run_job(&backend, &config, Local::now().date_naive()).await;
    }
}
