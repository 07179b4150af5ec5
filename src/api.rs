use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::Deserialize;

use crate::db::DbHandle;
use crate::models::{EventPage, IssueDetail};
use crate::permissions::{ENTITY_CHANNEL, ENTITY_ISSUE, Permission, PermissionResolver};

/// How many events an issue detail response carries before the client pages.
const DETAIL_EVENT_LIMIT: i64 = 20;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub permissions: PermissionResolver,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct UpdatePriorityRequest {
    pub priority: String,
}

#[derive(Deserialize)]
pub struct CreateProgramRequest {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Deserialize)]
pub struct UpdateProgramRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub owners: Option<Vec<String>>,
    pub channels: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct OwnerRequest {
    pub entity_kind: String,
    pub entity_id: String,
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
}

fn default_page_limit() -> i64 {
    DETAIL_EVENT_LIMIT
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/issues", get(list_issues))
        .route("/api/issues/{id}", get(get_issue_detail))
        .route("/api/issues/{id}/messages", get(get_issue_messages))
        .route("/api/issues/{id}/status", patch(update_issue_status))
        .route("/api/issues/{id}/priority", patch(update_issue_priority))
        .route("/api/programs", get(list_programs).post(create_program))
        .route(
            "/api/programs/{id}",
            put(update_program).delete(delete_program),
        )
        .route("/api/owners", post(set_owner).delete(remove_owner))
        .route("/api/me", get(me))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// The caller's external user id, from the `x-user-id` header. The session
/// layer in front of this API is an external collaborator; absent the
/// header, the caller is anonymous and resolves to the default level.
fn caller(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// The channel half of an issue's composite thread key, when present.
fn issue_channel(thread_key: Option<&str>) -> Option<String> {
    thread_key
        .and_then(|key| key.split_once(':'))
        .map(|(channel, _)| channel.to_string())
}

/// Permission pre-check: run the guarded action only when this returns Ok.
async fn require(
    state: &SharedState,
    user: &str,
    required: Permission,
    channel: Option<&str>,
    issue: Option<i64>,
) -> Result<(), ApiError> {
    let decision = state
        .permissions
        .check(user, required, channel, issue)
        .await?;
    match decision.denial_message() {
        None => Ok(()),
        Some(message) => Err(ApiError::Forbidden(message)),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_issues(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let issues = state.db.call(|db| db.list_issues()).await?;
    Ok(Json(issues))
}

async fn get_issue_detail(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            let Some(issue) = db.get_issue(id)? else {
                return Ok(None);
            };
            let total_events = db.count_issue_events(id)?;
            let events = db.page_issue_events(id, 0, DETAIL_EVENT_LIMIT)?;
            Ok(Some(IssueDetail {
                issue,
                events,
                total_events,
            }))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;
    Ok(Json(detail))
}

async fn get_issue_messages(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let offset = query.offset.max(0);
    let limit = query.limit.clamp(1, 200);
    let page = state
        .db
        .call(move |db| {
            if db.get_issue(id)?.is_none() {
                return Ok(None);
            }
            let total_events = db.count_issue_events(id)?;
            let events = db.page_issue_events(id, offset, limit)?;
            let returned = events.len();
            Ok(Some(EventPage {
                events,
                total_events,
                offset,
                limit,
                returned,
            }))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;
    Ok(Json(page))
}

async fn update_issue_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.status.is_empty() {
        return Err(ApiError::BadRequest("Status is required".to_string()));
    }
    let user = caller(&headers);

    let issue = state
        .db
        .call(move |db| db.get_issue(id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;
    let channel = issue_channel(issue.thread_key.as_deref());
    require(&state, &user, Permission::Owner, channel.as_deref(), Some(id)).await?;

    let status = req.status;
    let changed_by = user.clone();
    let (old_status, updated) = state
        .db
        .call(move |db| db.update_issue_status(id, &status, &changed_by))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;

    Ok(Json(serde_json::json!({
        "id": updated.id,
        "status": updated.status,
        "message": format!("Status updated from {} to {}", old_status, updated.status),
    })))
}

async fn update_issue_priority(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdatePriorityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.priority.is_empty() {
        return Err(ApiError::BadRequest("Priority is required".to_string()));
    }
    let user = caller(&headers);

    let issue = state
        .db
        .call(move |db| db.get_issue(id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;
    let channel = issue_channel(issue.thread_key.as_deref());
    require(&state, &user, Permission::Owner, channel.as_deref(), Some(id)).await?;

    let priority = req.priority;
    let updated = state
        .db
        .call(move |db| db.update_issue_priority(id, &priority))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;

    Ok(Json(serde_json::json!({
        "id": updated.id,
        "priority": updated.priority,
        "message": "Priority updated successfully",
    })))
}

async fn list_programs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let programs = state.db.call(|db| db.list_programs()).await?;
    Ok(Json(programs))
}

async fn create_program(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateProgramRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers);
    require(&state, &user, Permission::Admin, None, None).await?;

    if req.slug.is_empty() || req.name.is_empty() {
        return Err(ApiError::BadRequest(
            "slug and name are required".to_string(),
        ));
    }

    let program = state
        .db
        .call(move |db| {
            db.create_program(
                &req.slug,
                &req.name,
                &req.description,
                &req.owners,
                &req.channels,
            )
        })
        .await?
        .ok_or_else(|| ApiError::BadRequest("Program slug already exists".to_string()))?;
    Ok((StatusCode::CREATED, Json(program)))
}

async fn update_program(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateProgramRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers);
    require(&state, &user, Permission::Admin, None, None).await?;

    let program = state
        .db
        .call(move |db| {
            db.update_program(
                id,
                req.name.as_deref(),
                req.description.as_deref(),
                req.owners.as_deref(),
                req.channels.as_deref(),
            )
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("Program not found".to_string()))?;
    Ok(Json(program))
}

async fn delete_program(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers);
    require(&state, &user, Permission::Admin, None, None).await?;

    let deleted = state.db.call(move |db| db.soft_delete_program(id)).await?;
    if !deleted {
        return Err(ApiError::NotFound("Program not found".to_string()));
    }
    Ok(Json(
        serde_json::json!({"message": "Program deleted successfully"}),
    ))
}

/// Resolution context for an owner-set mutation: the entity itself.
fn owner_context(req: &OwnerRequest) -> Result<(Option<String>, Option<i64>), ApiError> {
    match req.entity_kind.as_str() {
        ENTITY_CHANNEL => Ok((Some(req.entity_id.clone()), None)),
        ENTITY_ISSUE => {
            let issue_id = req
                .entity_id
                .parse::<i64>()
                .map_err(|_| ApiError::BadRequest("Invalid issue id".to_string()))?;
            Ok((None, Some(issue_id)))
        }
        other => Err(ApiError::BadRequest(format!(
            "Invalid entity kind: {}",
            other
        ))),
    }
}

async fn set_owner(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<OwnerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers);
    let (channel, issue) = owner_context(&req)?;
    require(&state, &user, Permission::ProgramOwner, channel.as_deref(), issue).await?;

    state
        .db
        .call(move |db| db.set_owner(&req.entity_kind, &req.entity_id, &req.user_id))
        .await?;
    Ok(Json(serde_json::json!({"message": "Owner added"})))
}

async fn remove_owner(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<OwnerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers);
    let (channel, issue) = owner_context(&req)?;
    require(&state, &user, Permission::ProgramOwner, channel.as_deref(), issue).await?;

    let removed = state
        .db
        .call(move |db| db.remove_owner(&req.entity_kind, &req.entity_id, &req.user_id))
        .await?;
    if !removed {
        return Err(ApiError::NotFound("Owner not found".to_string()));
    }
    Ok(Json(serde_json::json!({"message": "Owner removed"})))
}

async fn me(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers);
    let permission = state.permissions.resolve(&user, None, None).await?;
    Ok(Json(serde_json::json!({
        "user_id": user,
        "permission": permission.as_str(),
    })))
}
