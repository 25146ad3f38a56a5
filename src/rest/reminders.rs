//! `POST /notify`: renders the reminder template for each invoice and sends
//! it over WhatsApp. The reminder worker calls this one id at a time.

use axum::{extract::State, Extension, Json};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use super::extract::ApiJson;
use super::{CurrentUser, SharedState};
use crate::error::ApiError;
use crate::models::{Channel, Invoice, User};
use crate::notify::NotifyError;
use crate::template::{invoice_vars, render, DEFAULT_REMINDER};
use crate::tenancy;

const DEFAULT_TEMPLATE: &str = "reminder";

#[derive(Serialize, Deserialize, ToSchema)]
pub struct NotifyRequest {
    pub ids: Vec<u64>,
    /// Template name on the whatsapp channel; defaults to `reminder`
    pub template: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct NotifyResult {
    pub id: u64,
    pub ok: bool,
    #[schema(value_type = Object)]
    pub detail: Value,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct NotifyResponse {
    pub sent: usize,
    pub results: Vec<NotifyResult>,
}

fn failed(id: u64, reason: &str) -> NotifyResult {
    NotifyResult {
        id,
        ok: false,
        detail: Value::String(reason.to_string()),
    }
}

#[utoipa::path(
    post,
    path = "/notify",
    request_body = NotifyRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Per-invoice delivery results", body = NotifyResponse),
        (status = 429, description = "Provider rate limit reached (Too Many Requests)"),
        (status = 500, description = "No messaging provider configured")
    )
)]
pub async fn notify(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiJson(payload): ApiJson<NotifyRequest>,
) -> Result<Json<NotifyResponse>, ApiError> {
    let messenger = state
        .messenger
        .clone()
        .ok_or_else(|| ApiError::Internal("messaging provider not configured".to_string()))?;

    let template_name = payload.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
    let body = match state.storage.get_template_by_name(Channel::Whatsapp, template_name)? {
        Some(template) => template.body,
        None => DEFAULT_REMINDER.to_string(),
    };
    let today = Local::now().date_naive();

    let mut results = Vec::with_capacity(payload.ids.len());
    for &id in &payload.ids {
        let Some(invoice) = state.storage.get_invoice(id)? else {
            results.push(failed(id, "invoice not found"));
            continue;
        };
        if !readable(&state, &me, &invoice)? {
            results.push(failed(id, "forbidden"));
            continue;
        }
        let Some(phone) = invoice.phone.as_deref() else {
            results.push(failed(id, "invoice has no phone"));
            continue;
        };

        let text = render(&body, &invoice_vars(&invoice, today));
        match messenger.send(phone, &text).await {
            Ok(reply) => {
                tracing::info!(invoice_id = id, "reminder sent");
                results.push(NotifyResult { id, ok: true, detail: reply });
            }
            Err(NotifyError::RateLimited) => {
                tracing::warn!(
                    invoice_id = id,
                    sent = results.iter().filter(|r| r.ok).count(),
                    "provider rate limit hit, stopping"
                );
                return Err(ApiError::RateLimited);
            }
            Err(e) => {
                tracing::warn!(invoice_id = id, error = %e, "reminder failed");
                results.push(failed(id, &e.to_string()));
            }
        }
    }

    Ok(Json(NotifyResponse {
        sent: results.iter().filter(|r| r.ok).count(),
        results,
    }))
}

fn readable(state: &SharedState, me: &User, invoice: &Invoice) -> Result<bool, ApiError> {
    let membership = match invoice.org_id {
        Some(org_id) => state.storage.get_membership(org_id, me.id)?,
        None => None,
    };
    Ok(tenancy::can_read(me, invoice, membership.as_ref()))
}
