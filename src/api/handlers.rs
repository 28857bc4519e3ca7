use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::HistoryConfig;
use crate::error::HistoryError;
use crate::logic::{
    BranchVerification, HistoryService, HistoryWalker, StructureSetup, StructureSetupResult,
};
use crate::model::{
    Branch, ChildRelationship, Commit, Id, NewBranch, NewChildRelationship, NewCommit,
    NewStructure, Structure,
};
use crate::store::traits::Store;

/// Shared handler state: the store plus the history tuning knobs
pub struct AppState<S> {
    pub store: Arc<S>,
    pub history: HistoryConfig,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            history: self.history.clone(),
        }
    }
}

impl<S> AppState<S> {
    pub fn new(store: Arc<S>, history: HistoryConfig) -> Self {
        Self { store, history }
    }
}

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn new(error: &HistoryError) -> Self {
        Self {
            error: error.to_string(),
            kind: error.kind().to_string(),
            retryable: error.is_retryable(),
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

fn status_for(error: &HistoryError) -> StatusCode {
    match error {
        HistoryError::Validation(_) => StatusCode::BAD_REQUEST,
        HistoryError::UnsavedCommit(_) => StatusCode::UNPROCESSABLE_ENTITY,
        HistoryError::NotFound { .. } => StatusCode::NOT_FOUND,
        HistoryError::MissingHead(_)
        | HistoryError::TransactionConflict { .. }
        | HistoryError::DuplicateId(_)
        | HistoryError::AlreadySeeded(_)
        | HistoryError::ConcurrentUpdate(_)
        | HistoryError::CommitAlreadyInHistory { .. }
        | HistoryError::CycleDetected { .. } => StatusCode::CONFLICT,
        HistoryError::TransactionTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        HistoryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<HistoryError> for (StatusCode, Json<ErrorResponse>) {
    fn from(error: HistoryError) -> Self {
        let status = status_for(&error);
        if status.is_server_error() {
            log::error!("Request failed: {}", error);
        }
        (status, Json(ErrorResponse::new(&error)))
    }
}

/// Structure together with its branches
#[derive(Debug, Serialize)]
pub struct StructureResponse {
    #[serde(flatten)]
    pub structure: Structure,
    pub branches: Vec<Branch>,
}

/// Branch with its resolved head edge
#[derive(Debug, Serialize)]
pub struct BranchResponse {
    #[serde(flatten)]
    pub branch: Branch,
    pub head_commit_id: Option<Id>,
}

#[derive(Debug, Deserialize)]
pub struct CommitRef {
    pub commit_id: Id,
}

// Structures

pub async fn list_structures<S: Store>(
    State(state): State<AppState<S>>,
) -> ApiResult<ListResponse<Structure>> {
    let structures = state.store.list_structures().await?;
    Ok(Json(structures.into()))
}

pub async fn create_structure<S: Store>(
    State(state): State<AppState<S>>,
    RequestJson(req): RequestJson<NewStructure>,
) -> Result<(StatusCode, Json<Structure>), ApiError> {
    let structure = HistoryService::create_structure(&*state.store, req).await?;
    Ok((StatusCode::CREATED, Json(structure)))
}

pub async fn setup_structure<S: Store>(
    State(state): State<AppState<S>>,
    RequestJson(req): RequestJson<StructureSetup>,
) -> Result<(StatusCode, Json<StructureSetupResult>), ApiError> {
    let result = HistoryService::setup_structure(&*state.store, req).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

pub async fn get_structure<S: Store>(
    Path(structure_id): Path<Id>,
    State(state): State<AppState<S>>,
) -> ApiResult<StructureResponse> {
    let structure = HistoryService::get_structure(&*state.store, &structure_id).await?;
    let branches = HistoryService::branches(&*state.store, &structure_id).await?;
    Ok(Json(StructureResponse {
        structure,
        branches,
    }))
}

pub async fn create_branch<S: Store>(
    Path(structure_id): Path<Id>,
    State(state): State<AppState<S>>,
    RequestJson(req): RequestJson<NewBranch>,
) -> Result<(StatusCode, Json<Branch>), ApiError> {
    let branch = HistoryService::create_branch(&*state.store, &structure_id, req).await?;
    Ok((StatusCode::CREATED, Json(branch)))
}

// Branches

pub async fn get_branch<S: Store>(
    Path(branch_id): Path<Id>,
    State(state): State<AppState<S>>,
) -> ApiResult<BranchResponse> {
    let branch = HistoryService::get_branch(&*state.store, &branch_id).await?;
    let head_commit_id = state.store.get_head(&branch_id).await?;
    Ok(Json(BranchResponse {
        branch,
        head_commit_id,
    }))
}

pub async fn get_branch_head<S: Store>(
    Path(branch_id): Path<Id>,
    State(state): State<AppState<S>>,
) -> ApiResult<Commit> {
    Ok(Json(HistoryService::head(&*state.store, &branch_id).await?))
}

pub async fn get_branch_log<S: Store>(
    Path(branch_id): Path<Id>,
    State(state): State<AppState<S>>,
) -> ApiResult<ListResponse<Commit>> {
    let commits = HistoryWalker::log(&*state.store, &branch_id).await?;
    Ok(Json(commits.into()))
}

pub async fn verify_branch<S: Store>(
    Path(branch_id): Path<Id>,
    State(state): State<AppState<S>>,
) -> ApiResult<BranchVerification> {
    Ok(Json(
        HistoryWalker::verify_branch(&*state.store, &branch_id).await?,
    ))
}

pub async fn seed_branch<S: Store>(
    Path(branch_id): Path<Id>,
    State(state): State<AppState<S>>,
    RequestJson(req): RequestJson<CommitRef>,
) -> ApiResult<Branch> {
    let branch = HistoryService::seed_branch(&*state.store, &branch_id, &req.commit_id).await?;
    Ok(Json(branch))
}

/// POST /branches/{branch_id}/advance
/// Append a saved commit to the branch and move head to it
pub async fn advance_branch<S: Store>(
    Path(branch_id): Path<Id>,
    State(state): State<AppState<S>>,
    RequestJson(req): RequestJson<CommitRef>,
) -> ApiResult<Commit> {
    let head = HistoryService::advance_head_with_retry(
        &*state.store,
        &branch_id,
        &req.commit_id,
        state.history.max_advance_attempts,
    )
    .await?;
    Ok(Json(head))
}

pub async fn checkout_branch<S: Store>(
    Path(branch_id): Path<Id>,
    State(state): State<AppState<S>>,
    RequestJson(req): RequestJson<CommitRef>,
) -> ApiResult<Branch> {
    let branch = HistoryService::checkout(&*state.store, &branch_id, &req.commit_id).await?;
    Ok(Json(branch))
}

// Commits

pub async fn create_commit<S: Store>(
    State(state): State<AppState<S>>,
    RequestJson(req): RequestJson<NewCommit>,
) -> Result<(StatusCode, Json<Commit>), ApiError> {
    let commit = HistoryService::create_commit(&*state.store, req).await?;
    Ok((StatusCode::CREATED, Json(commit)))
}

pub async fn get_commit<S: Store>(
    Path(commit_id): Path<Id>,
    State(state): State<AppState<S>>,
) -> ApiResult<Commit> {
    Ok(Json(
        HistoryService::get_commit(&*state.store, &commit_id).await?,
    ))
}

pub async fn get_next_commits<S: Store>(
    Path(commit_id): Path<Id>,
    State(state): State<AppState<S>>,
) -> ApiResult<ListResponse<Commit>> {
    let commits = HistoryService::next(&*state.store, &commit_id).await?;
    Ok(Json(commits.into()))
}

pub async fn get_previous_commits<S: Store>(
    Path(commit_id): Path<Id>,
    State(state): State<AppState<S>>,
) -> ApiResult<ListResponse<Commit>> {
    let commits = HistoryService::previous(&*state.store, &commit_id).await?;
    Ok(Json(commits.into()))
}

pub async fn list_children<S: Store>(
    Path(commit_id): Path<Id>,
    State(state): State<AppState<S>>,
) -> ApiResult<ListResponse<ChildRelationship>> {
    let children = HistoryService::children(&*state.store, &commit_id).await?;
    Ok(Json(children.into()))
}

pub async fn link_child<S: Store>(
    Path(commit_id): Path<Id>,
    State(state): State<AppState<S>>,
    RequestJson(req): RequestJson<NewChildRelationship>,
) -> Result<(StatusCode, Json<ChildRelationship>), ApiError> {
    let relationship = HistoryService::link_child(&*state.store, &commit_id, req).await?;
    Ok((StatusCode::CREATED, Json(relationship)))
}
