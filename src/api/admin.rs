use crate::auth::verify_internal_secret;
use crate::config::VaultConfig;
use crate::credentials::{TokenCodec, TokenStore};
use crate::error::VaultError;
use crate::jobs::{vault_status, JobOptions, MigrationJob, RotationJob};
use crate::keys::KeyProvider;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// State for the vault admin API.
#[derive(Clone)]
pub struct AdminAppState {
    pub store: Arc<dyn TokenStore>,
    pub codec: TokenCodec,
    pub options: JobOptions,
    /// Required bearer token for every admin call. None = admin API disabled.
    pub internal_secret: Option<String>,
    pub default_batch_limit: usize,
    /// Held while a migration or rotation runs
    pub job_lock: Arc<Mutex<()>>,
}

impl AdminAppState {
    pub fn from_config(store: Arc<dyn TokenStore>, config: &VaultConfig) -> Self {
        Self {
            store,
            codec: TokenCodec::new(Arc::new(KeyProvider::new(&config.keys))),
            options: JobOptions::from(&config.jobs),
            internal_secret: config.admin.internal_secret.clone(),
            default_batch_limit: config.jobs.default_batch_limit,
            job_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Deserialize)]
pub struct BatchParams {
    pub batch_limit: Option<usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    PreconditionFailed(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::PreconditionFailed(msg) => (StatusCode::PRECONDITION_FAILED, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}

impl From<VaultError> for AppError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Configuration(_) => AppError::PreconditionFailed(e.to_string()),
            other => AppError::ServerError(other.to_string()),
        }
    }
}

pub fn create_admin_router(state: AdminAppState) -> Router {
    Router::new()
        .route("/api/admin/vault/migrate", post(migrate))
        .route("/api/admin/vault/rotate", post(rotate))
        .route("/api/admin/vault/status", get(status))
        .with_state(Arc::new(state))
}

/// Rejects the call unless it carries the internal secret.
fn authorize(state: &AdminAppState, headers: &HeaderMap) -> Result<(), AppError> {
    verify_internal_secret(headers, state.internal_secret.as_deref()).map_err(|e| {
        warn!(reason = %e, "Rejected admin call");
        AppError::Unauthorized(e.to_string())
    })
}

fn batch_limit(state: &AdminAppState, params: &BatchParams) -> Result<usize, AppError> {
    match params.batch_limit {
        Some(0) => Err(AppError::BadRequest("batch_limit must be positive".to_string())),
        Some(limit) => Ok(limit),
        None => Ok(state.default_batch_limit),
    }
}

/// POST /api/admin/vault/migrate — encrypts legacy plaintext records.
async fn migrate(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
    Query(params): Query<BatchParams>,
) -> Result<Response, AppError> {
    authorize(&state, &headers)?;
    let limit = batch_limit(&state, &params)?;

    let _running = state
        .job_lock
        .try_lock()
        .map_err(|_| AppError::Conflict("another vault job is running".to_string()))?;

    info!(batch_limit = limit, "Admin migration requested");
    let job = MigrationJob::new(state.store.clone(), state.codec.clone(), state.options.clone());
    let summary = job.run(limit).await?;

    Ok(Json(summary).into_response())
}

/// POST /api/admin/vault/rotate — re-seals older records under the active key.
async fn rotate(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
    Query(params): Query<BatchParams>,
) -> Result<Response, AppError> {
    authorize(&state, &headers)?;
    let limit = batch_limit(&state, &params)?;

    let _running = state
        .job_lock
        .try_lock()
        .map_err(|_| AppError::Conflict("another vault job is running".to_string()))?;

    info!(batch_limit = limit, "Admin rotation requested");
    let job = RotationJob::new(state.store.clone(), state.codec.clone(), state.options.clone());
    let summary = job.run(limit).await?;

    Ok(Json(summary).into_response())
}

/// GET /api/admin/vault/status
async fn status(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize(&state, &headers)?;

    let report = vault_status(state.store.as_ref(), state.codec.keys()).await?;
    Ok(Json(report).into_response())
}
