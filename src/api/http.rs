//! HTTP adapter over [`CredentialApi`].

use super::CredentialApi;
use crate::credentials::{CredentialId, CredentialSummary};
use crate::error::CredvaultError;
use crate::oauth::{FlowSnapshot, StartedFlow};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// Shared application state for the credential API
#[derive(Clone)]
pub struct ApiAppState {
    pub api: CredentialApi,
}

/// Request body for POST /api/credentials
#[derive(Deserialize)]
pub struct AddCredentialRequest {
    pub service_name: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Serialize, Deserialize)]
pub struct AddCredentialResponse {
    pub id: CredentialId,
}

#[derive(Serialize, Deserialize)]
pub struct ListCredentialsResponse {
    pub credentials: Vec<CredentialSummary>,
}

#[derive(Serialize, Deserialize)]
pub struct DeleteCredentialResponse {
    pub success: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create credential API router
pub fn create_api_router(state: ApiAppState) -> Router {
    Router::new()
        .route("/api/credentials", post(add_credential).get(list_credentials))
        .route("/api/credentials/:id", delete(delete_credential))
        .route("/api/credentials/:id/oauth/start", post(start_oauth))
        .route("/api/credentials/:id/oauth/latest", get(latest_flow))
        .route("/api/flows/:flow_id", get(get_flow))
        .with_state(Arc::new(state))
}

/// POST /api/credentials - Register a service credential
async fn add_credential(
    State(state): State<Arc<ApiAppState>>,
    Json(req): Json<AddCredentialRequest>,
) -> Result<(StatusCode, Json<AddCredentialResponse>), AppError> {
    let id = state
        .api
        .add_service_credential(&req.service_name, &req.client_id, &req.client_secret)?;

    Ok((StatusCode::CREATED, Json(AddCredentialResponse { id })))
}

/// GET /api/credentials - List credentials (secrets redacted)
async fn list_credentials(
    State(state): State<Arc<ApiAppState>>,
) -> Result<Json<ListCredentialsResponse>, AppError> {
    let credentials = state.api.get_service_credentials()?;
    debug!(count = credentials.len(), "Listing credentials");

    Ok(Json(ListCredentialsResponse { credentials }))
}

/// DELETE /api/credentials/:id
async fn delete_credential(
    State(state): State<Arc<ApiAppState>>,
    Path(id): Path<CredentialId>,
) -> Result<Json<DeleteCredentialResponse>, AppError> {
    state.api.delete_service_credential(id).await?;
    Ok(Json(DeleteCredentialResponse { success: true }))
}

/// POST /api/credentials/:id/oauth/start - Begin an authorization flow
async fn start_oauth(
    State(state): State<Arc<ApiAppState>>,
    Path(id): Path<CredentialId>,
) -> Result<Json<StartedFlow>, AppError> {
    Ok(Json(state.api.begin_oauth_flow(id).await?))
}

/// GET /api/credentials/:id/oauth/latest - Most recent flow for a credential
async fn latest_flow(
    State(state): State<Arc<ApiAppState>>,
    Path(id): Path<CredentialId>,
) -> Result<Json<FlowSnapshot>, AppError> {
    state
        .api
        .latest_flow_for(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no flow for credential {}", id)))
}

/// GET /api/flows/:flow_id - Flow status
async fn get_flow(
    State(state): State<Arc<ApiAppState>>,
    Path(flow_id): Path<String>,
) -> Result<Json<FlowSnapshot>, AppError> {
    state
        .api
        .get_flow_status(&flow_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("flow {} not found", flow_id)))
}

/// Application error type
#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Unprocessable(String),
    BadGateway(String),
    InternalServerError(String),
}

impl From<CredvaultError> for AppError {
    fn from(e: CredvaultError) -> Self {
        let message = e.to_string();
        match e {
            CredvaultError::Validation(_) => AppError::BadRequest(message),
            CredvaultError::NotFound(_) => AppError::NotFound(message),
            CredvaultError::ProviderNotConfigured(_) => AppError::Unprocessable(message),
            CredvaultError::ExchangeRejected(_) | CredvaultError::Network(_) => {
                AppError::BadGateway(message)
            }
            CredvaultError::Listener(_) | CredvaultError::Storage(_) => {
                error!(error = %message, "Credential API request failed");
                AppError::InternalServerError(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}
