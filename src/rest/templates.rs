use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use utoipa::ToSchema;

use super::extract::{ApiJson, ApiPath};
use super::{require_admin, CurrentUser, SharedState};
use crate::error::ApiError;
use crate::models::{Channel, Template};

#[derive(Deserialize, ToSchema)]
pub struct CreateTemplateRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub body: String,
}

#[utoipa::path(
    get,
    path = "/templates",
    security(("bearer" = [])),
    responses((status = 200, description = "All templates", body = [Template]))
)]
pub async fn list_templates(
    State(state): State<SharedState>,
    Extension(_caller): Extension<CurrentUser>,
) -> Result<Json<Vec<Template>>, ApiError> {
    Ok(Json(state.storage.list_templates()?))
}

#[utoipa::path(
    post,
    path = "/templates",
    request_body = CreateTemplateRequest,
    security(("bearer" = [])),
    responses(
        (status = 201, description = "Template stored", body = Template),
        (status = 400, description = "Missing name or body"),
        (status = 403, description = "Admin only"),
        (status = 409, description = "Name already used on the channel")
    )
)]
pub async fn create_template(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiJson(payload): ApiJson<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<Template>), ApiError> {
    require_admin(&me)?;
    if payload.name.trim().is_empty() || payload.body.trim().is_empty() {
        return Err(ApiError::BadRequest("name and body are required".to_string()));
    }

    let template = state
        .storage
        .create_template(&payload.name, payload.channel, &payload.body)?;
    tracing::info!(template_id = template.id, name = %template.name, channel = %template.channel, "template created");
    Ok((StatusCode::CREATED, Json(template)))
}

#[utoipa::path(
    delete,
    path = "/templates/{id}",
    params(("id" = u64, Path, description = "Template id")),
    security(("bearer" = [])),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Admin only"),
        (status = 404, description = "No such template")
    )
)]
pub async fn delete_template(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiPath(id): ApiPath<u64>,
) -> Result<StatusCode, ApiError> {
    require_admin(&me)?;
    state.storage.delete_template(id)?;
    Ok(StatusCode::NO_CONTENT)
}
