use axum::{
    extract::State,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath};
use super::{require_admin, CurrentUser, MyOrganization, SharedState};
use crate::auth::normalize_username;
use crate::error::{ApiError, StorageError};
use crate::models::{OrgRole, OrgStatus, Organization};
use crate::storage::Storage;

#[derive(Deserialize, ToSchema)]
pub struct CreateOrgRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, ToSchema)]
pub struct AddMemberRequest {
    #[serde(default)]
    pub username: String,
    /// Defaults to `agent`
    pub role: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateOrgStatusRequest {
    pub status: OrgStatus,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, PartialEq)]
pub struct MemberView {
    pub username: String,
    pub role: OrgRole,
}

/// Inactive organizations are reported as missing.
fn active_org(storage: &Storage, org_id: Uuid) -> Result<Organization, ApiError> {
    storage
        .get_organization(org_id)?
        .filter(Organization::is_active)
        .ok_or_else(|| ApiError::NotFound("org not found".to_string()))
}

#[utoipa::path(
    post,
    path = "/orgs",
    request_body = CreateOrgRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Organization created, caller is owner", body = Organization),
        (status = 400, description = "Name shorter than 2 characters"),
        (status = 409, description = "Name taken")
    )
)]
pub async fn create_org(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiJson(payload): ApiJson<CreateOrgRequest>,
) -> Result<Json<Organization>, ApiError> {
    let name = payload.name.trim();
    if name.chars().count() < 2 {
        return Err(ApiError::BadRequest("invalid name".to_string()));
    }

    let (org, _owner) = state.storage.create_organization(name, me.id)?;
    tracing::info!(org_id = %org.id, owner = %me.username, "organization created");
    Ok(Json(org))
}

#[utoipa::path(
    get,
    path = "/orgs",
    security(("bearer" = [])),
    responses((status = 200, description = "Caller's organizations", body = [MyOrganization]))
)]
pub async fn list_my_orgs(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
) -> Result<Json<Vec<MyOrganization>>, ApiError> {
    let orgs = state
        .storage
        .organizations_for_user(me.id)?
        .into_iter()
        .map(|(organization, role)| MyOrganization { organization, role })
        .collect();
    Ok(Json(orgs))
}

#[utoipa::path(
    post,
    path = "/orgs/{org_id}/users",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    request_body = AddMemberRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Membership created or updated", body = MemberView),
        (status = 400, description = "Invalid role"),
        (status = 403, description = "Caller is not owner or manager"),
        (status = 404, description = "Organization or user not found")
    )
)]
pub async fn add_org_user(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiPath(org_id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<AddMemberRequest>,
) -> Result<Json<MemberView>, ApiError> {
    let org = active_org(&state.storage, org_id)?;

    let allowed = me.is_admin()
        || state
            .storage
            .get_membership(org.id, me.id)?
            .is_some_and(|m| m.role.can_manage_members());
    if !allowed {
        return Err(ApiError::forbidden());
    }

    let role: OrgRole = payload
        .role
        .as_deref()
        .unwrap_or("agent")
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid role".to_string()))?;

    let username = normalize_username(&payload.username);
    let user = state
        .storage
        .get_user_by_username(&username)?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;

    state.storage.upsert_membership(org.id, user.id, role)?;
    tracing::info!(org_id = %org.id, member = %user.username, %role, by = %me.username, "membership set");

    Ok(Json(MemberView {
        username: user.username,
        role,
    }))
}

#[utoipa::path(
    get,
    path = "/orgs/{org_id}/users",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Members and roles", body = [MemberView]),
        (status = 403, description = "Caller is not a member"),
        (status = 404, description = "Organization not found")
    )
)]
pub async fn list_org_users(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiPath(org_id): ApiPath<Uuid>,
) -> Result<Json<Vec<MemberView>>, ApiError> {
    let org = active_org(&state.storage, org_id)?;

    if !me.is_admin() && state.storage.get_membership(org.id, me.id)?.is_none() {
        return Err(ApiError::forbidden());
    }

    let mut members = vec![];
    for membership in state.storage.list_memberships(org.id)? {
        // Memberships of deleted users are skipped
        if let Some(user) = state.storage.get_user(membership.user_id)? {
            members.push(MemberView {
                username: user.username,
                role: membership.role,
            });
        }
    }
    Ok(Json(members))
}

/// Activates or deactivates an organization. Inactive organizations keep
/// their data but disappear from member management and invoice creation.
#[utoipa::path(
    patch,
    path = "/orgs/{org_id}",
    params(("org_id" = Uuid, Path, description = "Organization id")),
    request_body = UpdateOrgStatusRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Organization with its new status", body = Organization),
        (status = 403, description = "Admin only"),
        (status = 404, description = "Organization not found")
    )
)]
pub async fn update_org_status(
    State(state): State<SharedState>,
    Extension(CurrentUser(me)): Extension<CurrentUser>,
    ApiPath(org_id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<UpdateOrgStatusRequest>,
) -> Result<Json<Organization>, ApiError> {
    require_admin(&me)?;
    let org = state
        .storage
        .set_organization_status(org_id, payload.status)
        .map_err(|e| match e {
            StorageError::NotFound(_) => ApiError::NotFound("org not found".to_string()),
            other => other.into(),
        })?;
    tracing::info!(org_id = %org.id, status = ?org.status, by = %me.username, "organization status changed");
    Ok(Json(org))
}

#[cfg(test)]
mod tests {
    use crate::rest::create_router;
    use crate::rest::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_org_and_manage_members() {
        let app = create_router(test_state());
        let tony = register_and_login(&app, "tony").await;
        let jeff = register_and_login(&app, "jeff").await;
        register_and_login(&app, "hermann").await;

        let (status, _) = call(&app, "POST", "/orgs", Some(&tony), Some(json!({ "name": "N" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, org) = call(&app, "POST", "/orgs", Some(&tony), Some(json!({ "name": "NOA" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(org["status"], "active");
        let users_uri = format!("/orgs/{}/users", org["id"].as_str().unwrap());

        let (status, _) = call(&app, "POST", "/orgs", Some(&jeff), Some(json!({ "name": "noa" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        // jeff is not a member yet
        let (status, _) = call(&app, "GET", &users_uri, Some(&jeff), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, added) = call(&app, "POST", &users_uri, Some(&tony), Some(json!({ "username": "Jeff" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(added, json!({ "username": "jeff", "role": "agent" }));

        // agents cannot add members
        let (status, _) = call(&app, "POST", &users_uri, Some(&jeff), Some(json!({ "username": "hermann" }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, "POST", &users_uri, Some(&tony), Some(json!({ "username": "hermann", "role": "boss" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "POST", &users_uri, Some(&tony), Some(json!({ "username": "ghost" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, changed) = call(&app, "POST", &users_uri, Some(&tony), Some(json!({ "username": "jeff", "role": "manager" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(changed["role"], "manager");

        let (status, members) = call(&app, "GET", &users_uri, Some(&jeff), None).await;
        assert_eq!(status, StatusCode::OK);
        let members = members.as_array().unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.contains(&json!({ "username": "tony", "role": "owner" })));
        assert!(members.contains(&json!({ "username": "jeff", "role": "manager" })));

        let (_, mine) = call(&app, "GET", "/orgs", Some(&jeff), None).await;
        assert_eq!(mine[0]["role"], "manager");
        assert_eq!(mine[0]["organization"]["name"], "NOA");
    }

    #[tokio::test]
    async fn test_inactive_org_is_hidden() {
        let app = create_router(test_state());
        let admin = admin_token(&app).await;
        let tony = register_and_login(&app, "tony").await;
        register_and_login(&app, "jeff").await;
        let (_, org) = call(&app, "POST", "/orgs", Some(&tony), Some(json!({ "name": "NOA" }))).await;
        let org_uri = format!("/orgs/{}", org["id"].as_str().unwrap());
        let users_uri = format!("{}/users", org_uri);
        let inactive = json!({ "status": "inactive" });

        let (status, _) = call(&app, "PATCH", &org_uri, Some(&tony), Some(inactive.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, updated) = call(&app, "PATCH", &org_uri, Some(&admin), Some(inactive)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status"], "inactive");

        let (status, body) = call(&app, "POST", &users_uri, Some(&tony), Some(json!({ "username": "jeff" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "org not found");

        let invoice = json!({
            "client_name": "Ana",
            "amount": 10.0,
            "due_date": "2026-12-01",
            "org_id": org["id"]
        });
        let (status, _) = call(&app, "POST", "/invoices", Some(&tony), Some(invoice.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "PATCH", &org_uri, Some(&admin), Some(json!({ "status": "active" }))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "POST", "/invoices", Some(&tony), Some(invoice)).await;
        assert_eq!(status, StatusCode::CREATED);

        let missing = format!("/orgs/{}", uuid::Uuid::new_v4());
        let (status, _) = call(&app, "PATCH", &missing, Some(&admin), Some(json!({ "status": "active" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "PATCH", &org_uri, Some(&admin), Some(json!({ "status": "closed" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_malformed_org_id_is_a_json_400() {
        let app = create_router(test_state());
        let token = register_and_login(&app, "tony").await;
        let (status, body) = call(&app, "GET", "/orgs/not-a-uuid/users", Some(&token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_org_is_not_found() {
        let app = create_router(test_state());
        let token = register_and_login(&app, "tony").await;
        let uri = format!("/orgs/{}/users", uuid::Uuid::new_v4());
        let (status, body) = call(&app, "GET", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "org not found");
    }
}
