//! NOA Cobros server.
//!
//! Serves the REST API over a local sled database. Configuration comes from
//! the environment (a `.env` file is honoured):
//!
//!   DATA_DIR=noa_data BIND_ADDR=0.0.0.0:8080 JWT_SECRET_KEY=... cargo run
//!
//! Set `ADMIN_USERNAME` / `ADMIN_PASSWORD` to seed the admin account and
//! `WASENDER_API_TOKEN` to enable WhatsApp reminders on `/notify`.

use std::sync::Arc;
use tokio::net::TcpListener;

use noa_cobros::auth::hash_password;
use noa_cobros::config::AppConfig;
use noa_cobros::logging::init_logging;
use noa_cobros::models::UserRole;
use noa_cobros::notify::{Messenger, WaSenderClient};
use noa_cobros::rest::{create_router, AppState};
use noa_cobros::storage::Storage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    let _guard = init_logging("noa_cobros", &config.log_dir);

    let storage = Storage::open(&config.data_dir)?;
    tracing::info!(data_dir = %config.data_dir, "storage opened");

    if let Some(seed) = &config.admin_seed {
        let hash = hash_password(&seed.password, config.bcrypt_cost)?;
        let admin = storage.ensure_user(&seed.username, seed.email.clone(), hash, UserRole::Admin)?;
        tracing::info!(username = %admin.username, "admin account seeded");
    }

    let messenger: Option<Arc<dyn Messenger>> = match &config.wasender_token {
        Some(token) => Some(Arc::new(WaSenderClient::new(&config.wasender_base, token)?)),
        None => {
            tracing::warn!("WASENDER_API_TOKEN not set, /notify is disabled");
            None
        }
    };

    let bind_addr = config.bind_addr;
    let app = create_router(AppState::new(storage.clone(), config, messenger));

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "NOA Cobros listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    storage.flush().await?;
    tracing::info!("storage flushed, bye");
    Ok(())
}
