//! Environment-driven configuration for the server and the reminder worker.
//!
//! Binaries call `dotenvy::dotenv()` first, so a local `.env` file works the
//! same way as real environment variables.

use chrono::NaiveTime;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

const DEV_JWT_SECRET: &str = "noa-dev-secret-change-me";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("missing required variable {0}")]
    Missing(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Source of configuration values. The process environment in production,
/// a plain map in tests.
pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl Env for HashMap<&'static str, &'static str> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| v.to_string()).filter(|v| !v.trim().is_empty())
    }
}

fn parse<T: std::str::FromStr>(env: &dyn Env, key: &'static str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env.var(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn flag(env: &dyn Env, key: &str) -> bool {
    env.var(key).map(|v| v.trim() == "1").unwrap_or(false)
}

/// Credentials used to seed the initial admin on startup.
#[derive(Debug, Clone)]
pub struct AdminSeed {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: String,
    pub log_dir: String,
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub bcrypt_cost: u32,
    pub bootstrap_admin_key: Option<String>,
    pub admin_seed: Option<AdminSeed>,
    pub wasender_base: String,
    pub wasender_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: "noa_data".to_string(),
            log_dir: "logs".to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            token_ttl: Duration::from_secs(12 * 3600),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            bootstrap_admin_key: None,
            admin_seed: None,
            wasender_base: "https://www.wasenderapi.com".to_string(),
            wasender_token: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(env: &dyn Env) -> Result<Self> {
        let defaults = Self::default();

        let jwt_secret = match env.var("JWT_SECRET_KEY") {
            Some(secret) => secret,
            None => {
                tracing::warn!("JWT_SECRET_KEY not set, using the development secret");
                defaults.jwt_secret
            }
        };

        let ttl_hours: u64 = parse(env, "TOKEN_TTL_HOURS", 12)?;
        if ttl_hours == 0 {
            return Err(ConfigError::Invalid {
                key: "TOKEN_TTL_HOURS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let bcrypt_cost: u32 = parse(env, "BCRYPT_COST", defaults.bcrypt_cost)?;
        if !(4..=31).contains(&bcrypt_cost) {
            return Err(ConfigError::Invalid {
                key: "BCRYPT_COST",
                value: bcrypt_cost.to_string(),
                reason: "bcrypt cost must be between 4 and 31".to_string(),
            });
        }

        let admin_seed = match (env.var("ADMIN_USERNAME"), env.var("ADMIN_PASSWORD")) {
            (Some(username), Some(password)) => Some(AdminSeed {
                username,
                password,
                email: env.var("ADMIN_EMAIL"),
            }),
            _ => None,
        };

        Ok(Self {
            bind_addr: parse(env, "BIND_ADDR", defaults.bind_addr)?,
            data_dir: env.var("DATA_DIR").unwrap_or(defaults.data_dir),
            log_dir: env.var("LOG_DIR").unwrap_or(defaults.log_dir),
            jwt_secret,
            token_ttl: Duration::from_secs(ttl_hours * 3600),
            bcrypt_cost,
            bootstrap_admin_key: env.var("BOOTSTRAP_ADMIN_KEY"),
            admin_seed,
            wasender_base: env.var("WASENDER_API_BASE").unwrap_or(defaults.wasender_base),
            wasender_token: env.var("WASENDER_API_TOKEN").or_else(|| env.var("WASENDER_API_KEY")),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub backend_url: String,
    pub waves: Vec<i64>,
    pub pause: Duration,
    pub run_at: NaiveTime,
    pub run_on_start: bool,
    pub dry_run: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub log_dir: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(env: &dyn Env) -> Result<Self> {
        let backend_url = env
            .var("BACKEND_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let waves = match env.var("WAVE_DAYS") {
            Some(raw) => parse_waves(&raw)?,
            None => vec![15, 7, 0],
        };

        let pause_sec: u64 = parse(env, "PAUSE_SEC", 12)?;

        Ok(Self {
            backend_url,
            waves,
            pause: Duration::from_secs(pause_sec),
            run_at: parse_schedule(env)?,
            run_on_start: flag(env, "RUN_ON_START"),
            dry_run: flag(env, "DRY_RUN"),
            username: env.var("WORKER_USERNAME"),
            password: env.var("WORKER_PASSWORD"),
            log_dir: env.var("LOG_DIR").unwrap_or_else(|| "logs".to_string()),
        })
    }
}

/// Parses `"15,7,0"`. Spaces are ignored and empty items skipped.
pub fn parse_waves(raw: &str) -> Result<Vec<i64>> {
    raw.replace(' ', "")
        .split(',')
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<i64>().map_err(|e| ConfigError::Invalid {
                key: "WAVE_DAYS",
                value: raw.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Daily run time from `CRON_TIME="H:MM"`, or `CRON_HOUR` / `CRON_MINUTE`.
/// `CRON_HOUR` may itself carry `H:MM`. Defaults to 08:00.
pub fn parse_schedule(env: &dyn Env) -> Result<NaiveTime> {
    let (key, hour, minute) = match env.var("CRON_TIME").filter(|t| t.contains(':')) {
        Some(time) => split_hh_mm("CRON_TIME", &time)?,
        None => {
            let hour = env.var("CRON_HOUR").unwrap_or_else(|| "8".to_string());
            if hour.contains(':') {
                split_hh_mm("CRON_HOUR", &hour)?
            } else {
                let h = parse_component("CRON_HOUR", &hour)?;
                let m = parse(env, "CRON_MINUTE", 0u32)?;
                ("CRON_HOUR", h, m)
            }
        }
    };

    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| ConfigError::Invalid {
        key,
        value: format!("{}:{:02}", hour, minute),
        reason: "not a valid time of day".to_string(),
    })
}

fn split_hh_mm(key: &'static str, raw: &str) -> Result<(&'static str, u32, u32)> {
    let (h, m) = raw.split_once(':').ok_or(ConfigError::Missing(key))?;
    Ok((key, parse_component(key, h)?, parse_component(key, m)?))
}

fn parse_component(key: &'static str, raw: &str) -> Result<u32> {
    raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
