//! REST API layer (Axum).
//!
//! - Public: health, register, login, bootstrap-admin, OpenAPI document.
//! - Bearer-token protected: invoices, CSV export, stats, organizations,
//!   templates and reminder delivery.
//!
//! Handlers share one `AppState` (storage, config, token issuer, messenger)
//! and return `ApiError` for every failure path.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi, ToSchema};

use crate::auth::{hash_password, normalize_username, verify_password, TokenIssuer};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::models::{OrgRole, Organization, PublicUser, User, UserRole};
use crate::notify::Messenger;
use crate::storage::Storage;
use extract::ApiJson;

pub mod extract;
pub mod invoices;
pub mod orgs;
pub mod reminders;
pub mod templates;

/// Shared app state for REST handlers (Arc-wrapped for concurrency)
pub struct AppState {
    pub storage: Storage,
    pub config: AppConfig,
    pub tokens: TokenIssuer,
    pub messenger: Option<Arc<dyn Messenger>>,
}

impl AppState {
    pub fn new(storage: Storage, config: AppConfig, messenger: Option<Arc<dyn Messenger>>) -> Self {
        let tokens = TokenIssuer::new(&config.jwt_secret, config.token_ttl);
        Self {
            storage,
            config,
            tokens,
            messenger,
        }
    }
}

pub type SharedState = Arc<AppState>;

/// The authenticated caller, inserted by [`auth_middleware`].
#[derive(Clone, Debug)]
pub struct CurrentUser(pub User);

#[derive(Deserialize, ToSchema)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub email: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    #[serde(default, alias = "user", alias = "login")]
    pub username: String,
    #[serde(default, alias = "pass", alias = "pwd")]
    pub password: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub user: PublicUser,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub role: Option<String>,
    pub email: Option<String>,
    /// Existing account that owns the new one; unknown names are ignored
    pub parent_username: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct MeResponse {
    pub user: PublicUser,
    pub organizations: Vec<MyOrganization>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct MyOrganization {
    pub organization: Organization,
    pub role: OrgRole,
}

async fn auth_middleware(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .ok_or_else(ApiError::unauthorized)?;

    let claims = state.tokens.validate(token.trim()).map_err(|e| {
        tracing::debug!(error = %e, "rejected bearer token");
        ApiError::unauthorized()
    })?;

    // Re-read the user so deleted accounts and role changes apply immediately
    let user = claims
        .user_id()
        .map(|id| state.storage.get_user(id))
        .transpose()?
        .flatten()
        .ok_or_else(ApiError::unauthorized)?;

    req.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(req).await)
}

/// Create Axum router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let state: SharedState = Arc::new(state);

    let auth_routes = Router::new()
        .route("/me", get(me_handler))
        .route("/auth/admin/create-user", post(admin_create_user_handler))
        .route("/invoices", get(invoices::list_invoices).post(invoices::create_invoice))
        .route(
            "/invoices/:id",
            get(invoices::get_invoice)
                .patch(invoices::update_invoice)
                .delete(invoices::delete_invoice),
        )
        .route("/export/invoices.csv", get(invoices::export_invoices))
        .route("/stats", get(invoices::stats))
        .route("/orgs", post(orgs::create_org).get(orgs::list_my_orgs))
        .route("/orgs/:org_id", patch(orgs::update_org_status))
        .route("/orgs/:org_id/users", post(orgs::add_org_user).get(orgs::list_org_users))
        .route("/templates", get(templates::list_templates).post(templates::create_template))
        .route("/templates/:id", delete(templates::delete_template))
        .route("/notify", post(reminders::notify))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/bootstrap-admin", post(bootstrap_admin_handler))
        .route("/openapi.json", get(openapi_handler))
        .merge(auth_routes)
        .with_state(state)
}

async fn hash_blocking(password: String, cost: u32) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || hash_password(&password, cost))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn verify_blocking(password: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash).unwrap_or(false))
        .await
        .unwrap_or(false)
}

fn require_credentials(username: &str, password: &str) -> Result<String, ApiError> {
    let username = normalize_username(username);
    if username.is_empty() || password.is_empty() {
        return Err(ApiError::BadRequest("username/password required".to_string()));
    }
    Ok(username)
}

fn issue_token(state: &AppState, user: &User) -> Result<String, ApiError> {
    state
        .tokens
        .issue(user)
        .map_err(|e| ApiError::Internal(format!("token error: {}", e)))
}

pub(crate) fn require_admin(user: &User) -> Result<(), ApiError> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("admin only".to_string()))
    }
}

/// Health check handler
#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "ok": true,
        "service": "noa_cobros",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User created", body = PublicUser),
        (status = 400, description = "Missing username or password"),
        (status = 409, description = "Username taken")
    )
)]
pub async fn register_handler(
    State(state): State<SharedState>,
    ApiJson(payload): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<PublicUser>), ApiError> {
    let username = require_credentials(&payload.username, &payload.password)?;
    let hash = hash_blocking(payload.password, state.config.bcrypt_cost).await?;
    let user = state
        .storage
        .create_user(&username, payload.email, hash, UserRole::Client)?;

    tracing::info!(user_id = user.id, %username, "user registered");
    Ok((StatusCode::CREATED, Json(PublicUser::from(&user))))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Access token issued", body = LoginResponse),
        (status = 400, description = "Missing username or password"),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login_handler(
    State(state): State<SharedState>,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let username = require_credentials(&payload.username, &payload.password)?;
    let invalid = || ApiError::Unauthorized("invalid credentials".to_string());

    let user = state.storage.get_user_by_username(&username)?.ok_or_else(invalid)?;
    if !verify_blocking(payload.password, user.password_hash.clone()).await {
        tracing::info!(%username, "failed login");
        return Err(invalid());
    }

    Ok(Json(LoginResponse {
        access_token: issue_token(&state, &user)?,
        token_type: "bearer".to_string(),
        user: PublicUser::from(&user),
    }))
}

/// Creates the first admin. Guarded by the `X-Bootstrap-Key` header, and
/// refused once any admin exists.
#[utoipa::path(
    post,
    path = "/auth/bootstrap-admin",
    request_body = RegisterRequest,
    params(("X-Bootstrap-Key" = String, Header, description = "Configured bootstrap key")),
    responses(
        (status = 200, description = "Admin created, token returned"),
        (status = 401, description = "Missing or wrong bootstrap key"),
        (status = 409, description = "An admin already exists")
    )
)]
pub async fn bootstrap_admin_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    let provided = headers.get("x-bootstrap-key").and_then(|v| v.to_str().ok());
    match (&state.config.bootstrap_admin_key, provided) {
        (Some(expected), Some(given)) if expected == given => {}
        _ => return Err(ApiError::unauthorized()),
    }

    if state.storage.any_admin()? {
        return Err(ApiError::Conflict("admin already exists".to_string()));
    }

    let username = require_credentials(&payload.username, &payload.password)?;
    let hash = hash_blocking(payload.password, state.config.bcrypt_cost).await?;
    // Racing requests can both pass the check above; storage admits one.
    let user = state
        .storage
        .create_bootstrap_admin(&username, payload.email, hash)?;

    tracing::info!(user_id = user.id, %username, "bootstrap admin created");
    Ok(Json(json!({ "ok": true, "access_token": issue_token(&state, &user)? })))
}

#[utoipa::path(
    post,
    path = "/auth/admin/create-user",
    request_body = CreateUserRequest,
    security(("bearer" = [])),
    responses(
        (status = 201, description = "User created", body = PublicUser),
        (status = 403, description = "Caller is not an admin"),
        (status = 409, description = "Username taken")
    )
)]
pub async fn admin_create_user_handler(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiJson(payload): ApiJson<CreateUserRequest>,
) -> Result<(StatusCode, Json<PublicUser>), ApiError> {
    require_admin(&me)?;

    let username = require_credentials(&payload.username, &payload.password)?;
    // Unknown roles fall back to client
    let role = payload
        .role
        .as_deref()
        .and_then(|r| r.parse::<UserRole>().ok())
        .unwrap_or_default();

    let parent_id = match payload.parent_username.as_deref().map(normalize_username) {
        Some(parent) if !parent.is_empty() => {
            state.storage.get_user_by_username(&parent)?.map(|p| p.id)
        }
        _ => None,
    };

    let hash = hash_blocking(payload.password, state.config.bcrypt_cost).await?;
    let user = state
        .storage
        .create_user_under(&username, payload.email, hash, role, parent_id)?;

    tracing::info!(admin = %me.username, user_id = user.id, %role, "user created by admin");
    Ok((StatusCode::CREATED, Json(PublicUser::from(&user))))
}

#[utoipa::path(
    get,
    path = "/me",
    security(("bearer" = [])),
    responses((status = 200, description = "Caller and memberships", body = MeResponse))
)]
pub async fn me_handler(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
) -> Result<Json<MeResponse>, ApiError> {
    let organizations = state
        .storage
        .organizations_for_user(me.id)?
        .into_iter()
        .map(|(organization, role)| MyOrganization { organization, role })
        .collect();

    Ok(Json(MeResponse {
        user: PublicUser::from(&me),
        organizations,
    }))
}

async fn openapi_handler() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(title = "NOA Cobros API", description = "Invoices, organizations and WhatsApp reminders"),
    paths(
        health_handler,
        register_handler,
        login_handler,
        bootstrap_admin_handler,
        admin_create_user_handler,
        me_handler,
        invoices::list_invoices,
        invoices::create_invoice,
        invoices::get_invoice,
        invoices::update_invoice,
        invoices::delete_invoice,
        invoices::export_invoices,
        invoices::stats,
        orgs::create_org,
        orgs::list_my_orgs,
        orgs::update_org_status,
        orgs::add_org_user,
        orgs::list_org_users,
        templates::list_templates,
        templates::create_template,
        templates::delete_template,
        reminders::notify,
    ),
    components(schemas(
        crate::models::Invoice,
        crate::models::InvoiceState,
        crate::models::Organization,
        crate::models::OrgStatus,
        crate::models::OrgRole,
        crate::models::Template,
        crate::models::Channel,
        crate::models::UserRole,
        crate::stats::InvoiceStats,
        PublicUser,
        RegisterRequest,
        LoginRequest,
        LoginResponse,
        CreateUserRequest,
        MeResponse,
        MyOrganization,
        invoices::CreateInvoiceRequest,
        invoices::UpdateInvoiceRequest,
        orgs::CreateOrgRequest,
        orgs::AddMemberRequest,
        orgs::UpdateOrgStatusRequest,
        orgs::MemberView,
        templates::CreateTemplateRequest,
        reminders::NotifyRequest,
        reminders::NotifyResult,
        reminders::NotifyResponse,
    )),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;
