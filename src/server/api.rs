use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use commsync_common::{
    AssistantReply, MAX_BODY_CHARS, Message, ParticipantId, Rejection, RoomId,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::assistant::AssistantPipeline;
use super::db::{DbHandle, DuplicateProjectName};
use super::gatekeeper::{CredentialVerifier, Gatekeeper, bearer_token};
use super::models::Identity;
use super::registry::RoomRegistry;
use super::router::BroadcastRouter;
use super::store::{Caller, MessageStore, newest_first};
use crate::errors::{StoreError, ValidationError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub store: MessageStore,
    pub router: BroadcastRouter,
    pub gatekeeper: Gatekeeper,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        db: DbHandle,
        verifier: CredentialVerifier,
        assistant: Option<AssistantPipeline>,
    ) -> Self {
        let store = MessageStore::new(db.clone());
        let router = BroadcastRouter::new(Arc::new(RoomRegistry::new()), store.clone(), assistant);
        Self {
            gatekeeper: Gatekeeper::new(verifier, db.clone()),
            db,
            store,
            router,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        self.router.registry()
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUsersRequest {
    pub project_id: i64,
    pub users: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFileTreeRequest {
    pub project_id: i64,
    #[serde(default)]
    pub file_tree: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMessageRequest {
    pub message: String,
    pub message_type: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::InvalidRoom => ApiError::BadRequest(rejection.code().to_string()),
            Rejection::MissingCredential | Rejection::InvalidCredential => {
                ApiError::Unauthorized(rejection.code().to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccessDenied { .. } => ApiError::Forbidden(err.to_string()),
            StoreError::RoomNotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::Database(e) => internal(e),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = ?err, "Request failed");
    ApiError::Internal(err.to_string())
}

// ── Authentication ────────────────────────────────────────────────────

/// The caller's identity, taken from `Authorization: Bearer <token>`.
pub struct AuthUser(pub Identity);

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        state
            .gatekeeper
            .authenticate(bearer_token(&parts.headers))
            .map(AuthUser)
            .map_err(ApiError::from)
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/projects/create", post(create_project))
        .route("/projects/all", get(list_projects))
        .route("/projects/add-user", put(add_users))
        .route("/projects/update-file-tree", put(update_file_tree))
        .route("/projects/get-project/{project_id}", get(get_project))
        .route("/projects/get-messages/{project_id}", get(get_messages))
        .route("/projects/add-message/{project_id}", post(add_message))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn parse_room(raw: &str) -> Result<RoomId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest("Invalid project ID".to_string()))
}

/// Checks the project exists and the caller belongs to it.
async fn require_member(state: &AppState, room: RoomId, user: &ParticipantId) -> Result<(), ApiError> {
    let user = user.clone();
    let outcome = state
        .db
        .call(move |db| {
            if !db.project_exists(room.get())? {
                return Ok(Err(StoreError::RoomNotFound { room }));
            }
            if !db.is_member(room.get(), &user)? {
                return Ok(Err(StoreError::AccessDenied { room }));
            }
            Ok(Ok(()))
        })
        .await
        .map_err(internal)?;
    outcome.map_err(ApiError::from)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_project(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Project name is required".to_string()));
    }
    let creator = user.participant_id.clone();
    let project = state
        .db
        .call(move |db| db.create_project(&req.name, &creator))
        .await
        .map_err(|e| match e.downcast_ref::<DuplicateProjectName>() {
            Some(dup) => ApiError::BadRequest(dup.to_string()),
            None => internal(e),
        })?;
    info!(project_id = project.id, name = %project.name, "Project created");
    Ok((StatusCode::CREATED, Json(json!({ "project": project }))))
}

async fn list_projects(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let projects = state
        .db
        .call(move |db| db.list_projects_for_user(&user.participant_id))
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "projects": projects })))
}

async fn add_users(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<AddUsersRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = RoomId::new(req.project_id)
        .map_err(|_| ApiError::BadRequest("Invalid project ID".to_string()))?;
    if req.users.is_empty() {
        return Err(ApiError::BadRequest("users must not be empty".to_string()));
    }
    let users = req
        .users
        .into_iter()
        .map(ParticipantId::user)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    require_member(&state, room, &user.participant_id).await?;
    let project = state
        .db
        .call(move |db| db.add_members(room.get(), &users))
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "project": project })))
}

async fn get_project(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = parse_room(&project_id)?;
    require_member(&state, room, &user.participant_id).await?;
    let project = state
        .db
        .call(move |db| db.get_project(room.get()))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", room)))?;
    Ok(Json(json!({ "project": project })))
}

/// Replaces the project's shared file tree wholesale.
async fn update_file_tree(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<UpdateFileTreeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = RoomId::new(req.project_id)
        .map_err(|_| ApiError::BadRequest("Invalid project ID".to_string()))?;
    if !req.file_tree.is_object() {
        return Err(ApiError::BadRequest("File tree is required".to_string()));
    }

    require_member(&state, room, &user.participant_id).await?;
    let file_tree = req.file_tree;
    let project = state
        .db
        .call(move |db| db.update_file_tree(room.get(), &file_tree))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Project {} not found", room)))?;
    info!(project_id = project.id, "File tree updated");
    Ok(Json(json!({ "project": project })))
}

/// Historical fetch: the room log, newest first.
async fn get_messages(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = parse_room(&project_id)?;
    let messages = state.store.list_by_room(room, &user.participant_id).await?;
    let project_name = state
        .db
        .call(move |db| db.get_project(room.get()))
        .await
        .map_err(internal)?
        .map(|p| p.name)
        .unwrap_or_default();
    Ok(Json(json!({
        "success": true,
        "messages": newest_first(messages),
        "projectId": room,
        "projectName": project_name,
    })))
}

/// Non-realtime publish. Stored only; nothing is broadcast and `@ai` is not
/// acted on.
async fn add_message(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(project_id): Path<String>,
    Json(req): Json<AddMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let room = parse_room(&project_id)?;
    let draft = validate_add_message(&user, req)?;
    let stored = state
        .store
        .append(room, &Caller::Member(user.participant_id.clone()), draft)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": stored,
            "projectId": room,
        })),
    ))
}

fn validate_add_message(user: &Identity, req: AddMessageRequest) -> Result<Message, ValidationError> {
    let text = req.message.trim();
    if text.is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    let len = text.chars().count();
    if len > MAX_BODY_CHARS {
        return Err(ValidationError::BodyTooLong { len });
    }
    match req.message_type.as_deref() {
        None | Some("user") => Ok(Message::user_text(user.sender(), text, Utc::now())),
        Some("ai") => {
            // Recorded as assistant-text but attributed to the caller.
            let mut message = Message::assistant(&AssistantReply::plain(text), Utc::now());
            message.sender = user.sender();
            Ok(message)
        }
        Some(other) => Err(ValidationError::InvalidMessageType(other.to_string())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
