use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use chrono::{Local, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath, ApiQuery};
use super::{CurrentUser, SharedState};
use crate::error::ApiError;
use crate::export::invoices_to_csv;
use crate::models::{Invoice, InvoiceState, Membership, User};
use crate::stats::InvoiceStats;
use crate::storage::Storage;
use crate::tenancy;

#[derive(Deserialize, ToSchema)]
pub struct CreateInvoiceRequest {
    pub client_name: String,
    pub phone: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub description: String,
    pub reference: Option<String>,
    #[schema(value_type = String, format = Date)]
    pub due_date: NaiveDate,
    pub org_id: Option<Uuid>,
    pub state: Option<InvoiceState>,
}

/// Partial update. Empty `phone` / `reference` strings clear the field.
#[derive(Deserialize, ToSchema, Default)]
pub struct UpdateInvoiceRequest {
    pub client_name: Option<String>,
    pub phone: Option<String>,
    pub amount: Option<f64>,
    pub description: Option<String>,
    pub reference: Option<String>,
    #[schema(value_type = Option<String>, format = Date)]
    pub due_date: Option<NaiveDate>,
    pub state: Option<InvoiceState>,
}

#[derive(Deserialize, IntoParams, Default)]
#[into_params(parameter_in = Query)]
pub struct InvoiceFilter {
    pub state: Option<InvoiceState>,
    pub org_id: Option<Uuid>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn validate_amount(amount: f64) -> Result<(), ApiError> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(ApiError::BadRequest("amount must be a positive number".to_string()))
    }
}

fn validate_client(name: &str) -> Result<String, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("client_name is required".to_string()));
    }
    Ok(name.to_string())
}

/// Caller's membership in the invoice's organization (if it has one).
fn membership_for(storage: &Storage, user: &User, invoice: &Invoice) -> Result<Option<Membership>, ApiError> {
    match invoice.org_id {
        Some(org_id) => Ok(storage.get_membership(org_id, user.id)?),
        None => Ok(None),
    }
}

fn load_invoice(storage: &Storage, id: u64) -> Result<Invoice, ApiError> {
    storage
        .get_invoice(id)?
        .ok_or_else(|| ApiError::NotFound(format!("invoice {} not found", id)))
}

/// Invoices the user may read, optionally filtered.
pub(crate) fn visible_invoices(storage: &Storage, user: &User, filter: &InvoiceFilter) -> Result<Vec<Invoice>, ApiError> {
    let mut memberships: HashMap<Uuid, Option<Membership>> = HashMap::new();
    let mut visible = vec![];

    for invoice in storage.list_invoices()? {
        if filter.state.is_some_and(|s| s != invoice.state) {
            continue;
        }
        if filter.org_id.is_some() && filter.org_id != invoice.org_id {
            continue;
        }
        let membership = match invoice.org_id {
            Some(org_id) => match memberships.get(&org_id) {
                Some(cached) => cached.clone(),
                None => {
                    let found = storage.get_membership(org_id, user.id)?;
                    memberships.insert(org_id, found.clone());
                    found
                }
            },
            None => None,
        };
        if tenancy::can_read(user, &invoice, membership.as_ref()) {
            visible.push(invoice);
        }
    }

    Ok(visible)
}

#[utoipa::path(
    get,
    path = "/invoices",
    params(InvoiceFilter),
    security(("bearer" = [])),
    responses((status = 200, description = "Invoices visible to the caller", body = [Invoice]))
)]
pub async fn list_invoices(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiQuery(filter): ApiQuery<InvoiceFilter>,
) -> Result<Json<Vec<Invoice>>, ApiError> {
    Ok(Json(visible_invoices(&state.storage, &me, &filter)?))
}

#[utoipa::path(
    post,
    path = "/invoices",
    request_body = CreateInvoiceRequest,
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Invoice created", body = Invoice),
        (status = 400, description = "Validation failed"),
        (status = 403, description = "Caller cannot write into the organization"),
        (status = 404, description = "Organization not found")
    )
)]
pub async fn create_invoice(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiJson(payload): ApiJson<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<Invoice>), ApiError> {
    let client_name = validate_client(&payload.client_name)?;
    validate_amount(payload.amount)?;

    if let Some(org_id) = payload.org_id {
        let active = state.storage.get_organization(org_id)?.is_some_and(|o| o.is_active());
        if !active {
            return Err(ApiError::NotFound("org not found".to_string()));
        }
    }

    let now = Utc::now();
    let invoice = Invoice {
        id: 0,
        org_id: payload.org_id,
        client_name,
        phone: non_empty(payload.phone),
        amount: payload.amount,
        description: payload.description.trim().to_string(),
        state: payload.state.unwrap_or_default(),
        reference: non_empty(payload.reference),
        due_date: payload.due_date,
        created_by: me.id,
        created_at: now,
        updated_at: now,
    };

    let membership = membership_for(&state.storage, &me, &invoice)?;
    if !tenancy::can_write(&me, &invoice, membership.as_ref()) {
        return Err(ApiError::forbidden());
    }

    let invoice = state.storage.create_invoice(invoice)?;
    tracing::info!(invoice_id = invoice.id, user_id = me.id, org_id = ?invoice.org_id, "invoice created");
    Ok((StatusCode::CREATED, Json(invoice)))
}

#[utoipa::path(
    get,
    path = "/invoices/{id}",
    params(("id" = u64, Path, description = "Invoice id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "The invoice", body = Invoice),
        (status = 403, description = "Not visible to the caller"),
        (status = 404, description = "No such invoice")
    )
)]
pub async fn get_invoice(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiPath(id): ApiPath<u64>,
) -> Result<Json<Invoice>, ApiError> {
    let invoice = load_invoice(&state.storage, id)?;
    let membership = membership_for(&state.storage, &me, &invoice)?;
    if !tenancy::can_read(&me, &invoice, membership.as_ref()) {
        return Err(ApiError::forbidden());
    }
    Ok(Json(invoice))
}

#[utoipa::path(
    patch,
    path = "/invoices/{id}",
    params(("id" = u64, Path, description = "Invoice id")),
    request_body = UpdateInvoiceRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Updated invoice", body = Invoice),
        (status = 400, description = "Validation failed"),
        (status = 403, description = "Caller cannot modify the invoice"),
        (status = 404, description = "No such invoice")
    )
)]
pub async fn update_invoice(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiPath(id): ApiPath<u64>,
    ApiJson(payload): ApiJson<UpdateInvoiceRequest>,
) -> Result<Json<Invoice>, ApiError> {
    let mut invoice = load_invoice(&state.storage, id)?;
    let membership = membership_for(&state.storage, &me, &invoice)?;
    if !tenancy::can_write(&me, &invoice, membership.as_ref()) {
        return Err(ApiError::forbidden());
    }

    if let Some(name) = payload.client_name {
        invoice.client_name = validate_client(&name)?;
    }
    if let Some(amount) = payload.amount {
        validate_amount(amount)?;
        invoice.amount = amount;
    }
    if let Some(description) = payload.description {
        invoice.description = description.trim().to_string();
    }
    if payload.phone.is_some() {
        invoice.phone = non_empty(payload.phone);
    }
    if payload.reference.is_some() {
        invoice.reference = non_empty(payload.reference);
    }
    if let Some(due_date) = payload.due_date {
        invoice.due_date = due_date;
    }
    if let Some(new_state) = payload.state {
        if new_state != invoice.state {
            tracing::info!(invoice_id = id, from = %invoice.state, to = %new_state, "invoice state changed");
        }
        invoice.state = new_state;
    }
    invoice.updated_at = Utc::now();

    state.storage.update_invoice(&invoice)?;
    Ok(Json(invoice))
}

#[utoipa::path(
    delete,
    path = "/invoices/{id}",
    params(("id" = u64, Path, description = "Invoice id")),
    security(("bearer" = [])),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Caller cannot delete the invoice"),
        (status = 404, description = "No such invoice")
    )
)]
pub async fn delete_invoice(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiPath(id): ApiPath<u64>,
) -> Result<StatusCode, ApiError> {
    let invoice = load_invoice(&state.storage, id)?;
    let membership = membership_for(&state.storage, &me, &invoice)?;
    if !tenancy::can_delete(&me, &invoice, membership.as_ref()) {
        return Err(ApiError::forbidden());
    }

    state.storage.delete_invoice(id)?;
    tracing::info!(invoice_id = id, user_id = me.id, "invoice deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/export/invoices.csv",
    params(InvoiceFilter),
    security(("bearer" = [])),
    responses((status = 200, description = "CSV attachment", body = String, content_type = "text/csv"))
)]
pub async fn export_invoices(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiQuery(filter): ApiQuery<InvoiceFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let invoices = visible_invoices(&state.storage, &me, &filter)?;
    let csv = invoices_to_csv(&invoices).map_err(|e| ApiError::Internal(format!("csv error: {}", e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"invoices.csv\""),
        ],
        csv,
    ))
}

#[utoipa::path(
    get,
    path = "/stats",
    params(InvoiceFilter),
    security(("bearer" = [])),
    responses((status = 200, description = "Aggregates over visible invoices", body = InvoiceStats))
)]
pub async fn stats(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiQuery(filter): ApiQuery<InvoiceFilter>,
) -> Result<Json<InvoiceStats>, ApiError> {
    let invoices = visible_invoices(&state.storage, &me, &filter)?;
    Ok(Json(InvoiceStats::compute(&invoices, Local::now().date_naive())))
}

#[cfg(test)]
mod tests {
    use crate::rest::create_router;
    use crate::rest::test_support::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn new_invoice(client: &str) -> Value {
        json!({
            "client_name": client,
            "phone": "50688887777",
            "amount": 150.0,
            "description": "Mensualidad",
            "due_date": "2026-11-01"
        })
    }

    #[tokio::test]
    async fn test_invoice_crud_roundtrip() {
        let app = create_router(test_state());
        let token = register_and_login(&app, "ana").await;

        let (status, created) = call(&app, "POST", "/invoices", Some(&token), Some(new_invoice("Cliente A"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["state"], "pending");
        assert_eq!(created["client_name"], "Cliente A");
        let id = created["id"].as_u64().unwrap();

        let uri = format!("/invoices/{}", id);
        let (status, patched) = call(
            &app,
            "PATCH",
            &uri,
            Some(&token),
            Some(json!({ "state": "paid", "reference": "F-9", "phone": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["state"], "paid");
        assert_eq!(patched["reference"], "F-9");
        assert!(patched["phone"].is_null());

        let (status, listed) = call(&app, "GET", "/invoices?state=paid", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "DELETE", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invoice_validation() {
        let app = create_router(test_state());
        let token = register_and_login(&app, "ana").await;

        let mut bad = new_invoice("  ");
        let (status, _) = call(&app, "POST", "/invoices", Some(&token), Some(bad.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        bad["client_name"] = json!("Ok");
        bad["amount"] = json!(-3);
        let (status, body) = call(&app, "POST", "/invoices", Some(&token), Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("amount"));

        let mut unknown_org = new_invoice("X");
        unknown_org["org_id"] = json!(uuid::Uuid::new_v4());
        let (status, _) = call(&app, "POST", "/invoices", Some(&token), Some(unknown_org)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_requests_are_json_400() {
        let app = create_router(test_state());
        let token = register_and_login(&app, "ana").await;

        let mut missing_due = new_invoice("Cliente A");
        missing_due.as_object_mut().unwrap().remove("due_date");
        let (status, body) = call(&app, "POST", "/invoices", Some(&token), Some(missing_due)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("due_date"));

        let (status, body) = post_raw(&app, "/invoices", Some(&token), "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, body) = call(&app, "GET", "/invoices/abc", Some(&token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, body) = call(&app, "GET", "/invoices?state=bogus", Some(&token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_personal_invoices_are_private() {
        let app = create_router(test_state());
        let ana = register_and_login(&app, "ana").await;
        let beto = register_and_login(&app, "beto").await;
        let admin = admin_token(&app).await;

        let (_, created) = call(&app, "POST", "/invoices", Some(&ana), Some(new_invoice("A"))).await;
        let uri = format!("/invoices/{}", created["id"]);

        let (status, _) = call(&app, "GET", &uri, Some(&beto), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (_, listed) = call(&app, "GET", "/invoices", Some(&beto), None).await;
        assert!(listed.as_array().unwrap().is_empty());

        let (status, _) = call(&app, "GET", &uri, Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_org_invoices_follow_roles() {
        let app = create_router(test_state());
        let owner = register_and_login(&app, "owner").await;
        let viewer = register_and_login(&app, "viewer").await;

        let (_, org) = call(&app, "POST", "/orgs", Some(&owner), Some(json!({ "name": "NOA" }))).await;
        let org_id = org["id"].as_str().unwrap().to_string();
        let (status, _) = call(
            &app,
            "POST",
            &format!("/orgs/{}/users", org_id),
            Some(&owner),
            Some(json!({ "username": "viewer", "role": "viewer" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mut payload = new_invoice("Org client");
        payload["org_id"] = json!(org_id);
        let (status, _) = call(&app, "POST", "/invoices", Some(&viewer), Some(payload.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, created) = call(&app, "POST", "/invoices", Some(&owner), Some(payload)).await;
        assert_eq!(status, StatusCode::CREATED);
        let uri = format!("/invoices/{}", created["id"]);

        let (status, _) = call(&app, "GET", &uri, Some(&viewer), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "PATCH", &uri, Some(&viewer), Some(json!({ "state": "paid" }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, "DELETE", &uri, Some(&viewer), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, listed) = call(&app, "GET", &format!("/invoices?org_id={}", org_id), Some(&viewer), None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_export_csv_and_stats() {
        let app = create_router(test_state());
        let token = register_and_login(&app, "ana").await;
        call(&app, "POST", "/invoices", Some(&token), Some(new_invoice("Uno"))).await;
        call(&app, "POST", "/invoices", Some(&token), Some(new_invoice("Dos, S.A."))).await;

        let request = Request::builder()
            .uri("/export/invoices.csv")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/csv; charset=utf-8");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,org_id,client_name"));
        assert!(lines[2].contains("\"Dos, S.A.\""));

        let (status, stats) = call(&app, "GET", "/stats", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total"], 2);
        assert_eq!(stats["pending"], 2);
        assert_eq!(stats["amount_pending"], 300.0);
    }
}
