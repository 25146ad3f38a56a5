//! Daily reminder job.
//!
//! Pending invoices are grouped into waves by the number of days left until
//! their due date (T-15, T-7, T-0 by default). Each wave is sent through the
//! server's `/notify` endpoint one invoice at a time with a fixed pause, and
//! a rate-limited send is retried once after a minute.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime};
use reqwest::{header::CONTENT_TYPE, Client};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::WorkerConfig;
use crate::models::{Invoice, InvoiceState};

/// Wait before the single retry of a rate-limited send.
pub const RATE_LIMIT_RETRY: Duration = Duration::from_secs(60);

const FETCH_TIMEOUT: Duration = Duration::from_secs(40);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("login rejected ({status}): {body}")]
    Login { status: u16, body: String },

    #[error("backend answered {status}: {body}")]
    Backend { status: u16, body: String },
}

/// Outcome of one `/notify` call as seen by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyReply {
    pub ok: bool,
    /// HTTP status of the answer; `None` when no response arrived
    pub status: Option<u16>,
    pub body: Value,
}

impl NotifyReply {
    fn failed(reason: String, status: Option<u16>) -> Self {
        Self {
            ok: false,
            status,
            body: Value::String(reason),
        }
    }
}

impl WorkerError {
    /// HTTP status behind the error, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            WorkerError::Http(e) => e.status().map(|s| s.as_u16()),
            WorkerError::Login { status, .. } | WorkerError::Backend { status, .. } => Some(*status),
        }
    }
}

#[async_trait]
pub trait ReminderBackend: Send + Sync {
    async fn fetch_invoices(&self) -> Result<Vec<Invoice>, WorkerError>;
    async fn notify(&self, ids: &[u64]) -> Result<NotifyReply, WorkerError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub id: u64,
    pub ok: bool,
    pub retried: bool,
    pub reply: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaveSummary {
    pub days: i64,
    pub ids: Vec<u64>,
    pub delivered: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSummary {
    pub waves: Vec<WaveSummary>,
    /// Ids attempted across all waves, delivered or not
    pub total: usize,
    pub fetch_failed: bool,
}

pub fn days_until(due: NaiveDate, today: NaiveDate) -> i64 {
    (due - today).num_days()
}

/// Groups pending invoices whose days-to-due exactly matches a wave, in the
/// configured wave order. Repeated wave values are collapsed.
pub fn bucket_by_wave(invoices: &[Invoice], waves: &[i64], today: NaiveDate) -> Vec<(i64, Vec<u64>)> {
    let mut seen = HashSet::new();
    waves
        .iter()
        .filter(|&&days| seen.insert(days))
        .map(|&days| {
            let ids = invoices
                .iter()
                .filter(|inv| inv.state == InvoiceState::Pending)
                .filter(|inv| days_until(inv.due_date, today) == days)
                .map(|inv| inv.id)
                .collect();
            (days, ids)
        })
        .collect()
}

/// A failed reply answered with HTTP 429 or carrying "Too Many Requests"
/// in its body.
pub fn contains_rate_limit(reply: &NotifyReply) -> bool {
    if reply.ok {
        return false;
    }
    if reply.status == Some(429) {
        return true;
    }
    let text = match &reply.body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.contains("Too Many Requests")
}

async fn notify_one(backend: &dyn ReminderBackend, id: u64) -> NotifyReply {
    match backend.notify(&[id]).await {
        Ok(reply) => reply,
        Err(e) => NotifyReply::failed(e.to_string(), e.status()),
    }
}

/// Sends one id per call and sleeps `pause` after each id.
pub async fn send_ids_slow(backend: &dyn ReminderBackend, ids: &[u64], pause: Duration) -> Vec<SendOutcome> {
    let mut outcomes = Vec::with_capacity(ids.len());
    for &id in ids {
        let mut reply = notify_one(backend, id).await;
        let mut retried = false;
        if contains_rate_limit(&reply) {
            tracing::warn!(invoice_id = id, "rate limited, retrying in {}s", RATE_LIMIT_RETRY.as_secs());
            tokio::time::sleep(RATE_LIMIT_RETRY).await;
            reply = notify_one(backend, id).await;
            retried = true;
        }
        if !reply.ok {
            tracing::warn!(invoice_id = id, reply = %reply.body, "reminder not delivered");
        }
        outcomes.push(SendOutcome {
            id,
            ok: reply.ok,
            retried,
            reply: reply.body,
        });
        tokio::time::sleep(pause).await;
    }
    outcomes
}

pub async fn run_job(backend: &dyn ReminderBackend, config: &WorkerConfig, today: NaiveDate) -> JobSummary {
    tracing::info!(
        backend = %config.backend_url,
        waves = ?config.waves,
        pause_secs = config.pause.as_secs(),
        dry_run = config.dry_run,
        "reminder run starting"
    );

    let invoices = match backend.fetch_invoices().await {
        Ok(invoices) => invoices,
        Err(e) => {
            tracing::error!(error = %e, "could not fetch invoices");
            return JobSummary {
                fetch_failed: true,
                ..Default::default()
            };
        }
    };

    let mut summary = JobSummary::default();
    for (days, ids) in bucket_by_wave(&invoices, &config.waves, today) {
        tracing::info!(wave = days, count = ids.len(), "wave T-{}", days);
        if ids.is_empty() {
            continue;
        }
        let outcomes = send_ids_slow(backend, &ids, config.pause).await;
        let delivered = outcomes.iter().filter(|o| o.ok).count();
        tracing::info!(wave = days, delivered, count = ids.len(), "wave T-{} sent {}/{}", days, delivered, ids.len());
        summary.total += ids.len();
        summary.waves.push(WaveSummary { days, ids, delivered });
    }

    tracing::info!(total = summary.total, "reminder run finished");
    summary
}

/// Next local datetime at `at` strictly after `now`.
pub fn next_run_after(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

#[derive(Deserialize)]
struct LoginReply {
    access_token: String,
}

/// Talks to the NOA Cobros server over HTTP with the worker's own account.
pub struct HttpBackend {
    client: Client,
    base: String,
    credentials: Option<(String, String)>,
    dry_run: bool,
    token: Mutex<Option<String>>,
}

impl HttpBackend {
    pub fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Ok(Self {
            client: Client::builder().build()?,
            base: config.backend_url.clone(),
            credentials,
            dry_run: config.dry_run,
            token: Mutex::new(None),
        })
    }

    async fn login(&self) -> Result<Option<String>, WorkerError> {
        let Some((username, password)) = &self.credentials else {
            return Ok(None);
        };
        let res = self
            .client
            .post(format!("{}/auth/login", self.base))
            .timeout(FETCH_TIMEOUT)
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            return Err(WorkerError::Login {
                status,
                body: res.text().await.unwrap_or_default(),
            });
        }
        let reply: LoginReply = res.json().await?;
        Ok(Some(reply.access_token))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder, token: &Option<String>) -> reqwest::RequestBuilder {
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl ReminderBackend for HttpBackend {
    /// Logs in again on every fetch so a long-lived worker never runs on an
    /// expired token.
    async fn fetch_invoices(&self) -> Result<Vec<Invoice>, WorkerError> {
        let token = self.login().await?;
        *self.token.lock().await = token.clone();

        let res = self
            .authorized(self.client.get(format!("{}/invoices", self.base)), &token)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            return Err(WorkerError::Backend {
                status,
                body: res.text().await.unwrap_or_default(),
            });
        }
        Ok(res.json().await?)
    }

    async fn notify(&self, ids: &[u64]) -> Result<NotifyReply, WorkerError> {
        if self.dry_run {
            tracing::info!(?ids, "dry run, not sending");
            return Ok(NotifyReply {
                ok: true,
                status: None,
                body: json!({ "dry_run": true, "ids": ids }),
            });
        }

        let token = self.token.lock().await.clone();
        let res = self
            .authorized(self.client.post(format!("{}/notify", self.base)), &token)
            .timeout(NOTIFY_TIMEOUT)
            .json(&json!({ "ids": ids }))
            .send()
            .await?;

        let status = res.status();
        let is_json = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));
        let text = res.text().await?;
        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        let all_delivered = body["results"]
            .as_array()
            .map_or(true, |results| results.iter().all(|r| r["ok"] == Value::Bool(true)));
        Ok(NotifyReply {
            ok: status.is_success() && all_delivered,
            status: Some(status.as_u16()),
            body,
        })
    }
}
