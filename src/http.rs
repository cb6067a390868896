//! HTTP surface over the audit pipeline.
//!
//! Thin handlers only: every route delegates to the orchestrator, the
//! resolver, the scorer or the chain reader. Errors render as
//! `{"error": <message>, "status": <code>}`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::pipeline::abi::{AbiResolver, AbiSourceTag, InterfaceDescription, ResolveRequest};
use crate::pipeline::chain::{read_member, ChainError, ChainReader};
use crate::pipeline::error::{JobError, PersistenceError, ResolutionError, ScoringError};
use crate::pipeline::features::{extract, FeatureVector, FEATURE_COUNT};
use crate::pipeline::jobs::{AuditOptions, Job, JobId, JobOrchestrator, JobStatus};
use crate::pipeline::record::{AuditFilter, AuditId, AuditRecord};
use crate::pipeline::scoring::{RiskAssessment, RiskScorer};
use crate::pipeline::types::{ContractAddress, Network};

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    pub version: String,
    pub startup_time: i64,
    pub orchestrator: Arc<JobOrchestrator>,
    pub resolver: Arc<AbiResolver>,
    pub scorer: Arc<RiskScorer>,
    pub chain: Option<Arc<dyn ChainReader>>,
}

impl HttpState {
    pub fn new(
        orchestrator: Arc<JobOrchestrator>,
        resolver: Arc<AbiResolver>,
        scorer: Arc<RiskScorer>,
    ) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            startup_time: chrono::Utc::now().timestamp(),
            orchestrator,
            resolver,
            scorer,
            chain: None,
        }
    }

    pub fn with_chain_reader(mut self, chain: Arc<dyn ChainReader>) -> Self {
        self.chain = Some(chain);
        self
    }
}

/// Error response with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(target: "auditor::http", status = %self.status, "{}", self.message);
        }
        let body = json!({
            "error": self.message,
            "status": self.status.as_u16(),
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        let status = match err {
            PersistenceError::WriteConflict(_) => StatusCode::CONFLICT,
            PersistenceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(_) => Self::not_found(err.to_string()),
            JobError::AlreadyTerminal { .. } | JobError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, err.to_string())
            }
            JobError::QueueUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            JobError::Persistence(e) => e.into(),
        }
    }
}

impl From<ResolutionError> for ApiError {
    fn from(err: ResolutionError) -> Self {
        match err {
            ResolutionError::NotFound { .. } => Self::not_found(err.to_string()),
            ResolutionError::RemoteUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
        }
    }
}

impl From<ScoringError> for ApiError {
    fn from(err: ScoringError) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        let status = match err {
            ChainError::UnknownMember(_) => StatusCode::NOT_FOUND,
            ChainError::NotReadOnly(_) | ChainError::RequiresArguments(_) => {
                StatusCode::BAD_REQUEST
            }
            ChainError::Reverted(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChainError::Rpc(_) | ChainError::Decode { .. } => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_address(raw: &str) -> ApiResult<ContractAddress> {
    raw.parse()
        .map_err(|e| ApiError::bad_request(format!("invalid address '{raw}': {e}")))
}

fn parse_description(value: &Value) -> ApiResult<InterfaceDescription> {
    InterfaceDescription::from_value(value)
        .map_err(|e| ApiError::bad_request(format!("invalid ABI: {e}")))
}

/// Health check response.
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: i64,
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<HttpState>>) -> Json<HealthResponse> {
    let now = chrono::Utc::now().timestamp();
    let uptime = now - state.startup_time;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime_seconds: uptime,
    })
}

#[derive(Debug, Deserialize)]
pub struct SubmitAuditRequest {
    pub address: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub override_manual: bool,
    /// Call-scoped JSON ABI.
    #[serde(default)]
    pub abi: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitAuditResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

async fn submit_audit(
    State(state): State<Arc<HttpState>>,
    Json(request): Json<SubmitAuditRequest>,
) -> ApiResult<(StatusCode, Json<SubmitAuditResponse>)> {
    let address = parse_address(&request.address)?;
    let network = request.network.map(Network::new).unwrap_or_default();
    let caller_abi = request.abi.as_ref().map(parse_description).transpose()?;

    let options = AuditOptions {
        force_refresh: request.force_refresh,
        override_manual: request.override_manual,
        caller_abi,
    };
    let job_id = state.orchestrator.submit(address, network, options).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitAuditResponse {
            job_id,
            status: JobStatus::Pending,
        }),
    ))
}

async fn get_job(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.status(JobId(id)).await?))
}

async fn cancel_job(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.cancel(JobId(id)).await?))
}

async fn get_audit(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<AuditRecord>> {
    state
        .orchestrator
        .get_audit(AuditId(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("audit {id} not found")))
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub address: Option<String>,
    pub network: Option<String>,
    pub limit: Option<u32>,
}

async fn list_audits(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditRecord>>> {
    let filter = AuditFilter {
        address: query.address.as_deref().map(parse_address).transpose()?,
        network: query.network.map(Network::new),
        limit: query.limit,
    };
    Ok(Json(state.orchestrator.list_audits(&filter).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AbiResponse {
    pub address: ContractAddress,
    pub network: Network,
    pub source: AbiSourceTag,
    pub abi: InterfaceDescription,
}

async fn save_abi(
    State(state): State<Arc<HttpState>>,
    Path((network, address)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Json<AbiResponse>> {
    let address = parse_address(&address)?;
    let network = Network::new(network);
    let description = parse_description(&body)?;

    state
        .resolver
        .save(address, network.clone(), &description)
        .await?;

    Ok(Json(AbiResponse {
        address,
        network,
        source: AbiSourceTag::ManualOverride,
        abi: description,
    }))
}

async fn get_abi(
    State(state): State<Arc<HttpState>>,
    Path((network, address)): Path<(String, String)>,
) -> ApiResult<Json<AbiResponse>> {
    let address = parse_address(&address)?;
    let network = Network::new(network);

    let entry = state
        .resolver
        .cached(&address, &network)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no cached ABI for {address} on {network}")))?;

    Ok(Json(AbiResponse {
        address: entry.address,
        network: entry.network,
        source: entry.source,
        abi: entry.description,
    }))
}

async fn call_member(
    State(state): State<Arc<HttpState>>,
    Path((network, address, member)): Path<(String, String, String)>,
) -> ApiResult<Json<Value>> {
    let address = parse_address(&address)?;
    let network = Network::new(network);

    let chain = state.chain.as_ref().ok_or_else(|| {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "no chain reader configured")
    })?;
    if *chain.network() != network {
        return Err(ApiError::bad_request(format!(
            "chain reader is connected to {}, not {network}",
            chain.network()
        )));
    }

    let resolved = state
        .resolver
        .resolve(ResolveRequest::new(address, network))
        .await?;
    let value = read_member(&**chain, &address, &resolved.description, &member).await?;

    Ok(Json(json!({
        "address": address,
        "member": member,
        "value": value,
    })))
}

/// Either a ready feature vector or an ABI (plus optional bytecode) to extract one from.
#[derive(Debug, Default, Deserialize)]
pub struct ScoreRequest {
    #[serde(default)]
    pub features: Option<Vec<f64>>,
    #[serde(default)]
    pub abi: Option<Value>,
    /// Hex-encoded deployed bytecode, `0x` prefix optional.
    #[serde(default)]
    pub bytecode: Option<String>,
}

/// Scores without creating a job or touching the audit store.
async fn score_features(
    State(state): State<Arc<HttpState>>,
    Json(request): Json<ScoreRequest>,
) -> ApiResult<Json<RiskAssessment>> {
    let features = match (request.features, request.abi) {
        (Some(values), None) => {
            if request.bytecode.is_some() {
                return Err(ApiError::bad_request("bytecode is only used together with abi"));
            }
            let values: [f64; FEATURE_COUNT] = values.as_slice().try_into().map_err(|_| {
                ApiError::bad_request(format!(
                    "expected {FEATURE_COUNT} features, got {}",
                    values.len()
                ))
            })?;
            FeatureVector::from_array(values)
        }
        (None, Some(abi)) => {
            let description = parse_description(&abi)?;
            let bytecode = request
                .bytecode
                .as_deref()
                .map(|raw| {
                    hex::decode(raw.trim_start_matches("0x"))
                        .map_err(|e| ApiError::bad_request(format!("invalid bytecode: {e}")))
                })
                .transpose()?;
            extract(&description, bytecode.as_deref())
        }
        _ => return Err(ApiError::bad_request("provide exactly one of features or abi")),
    };

    Ok(Json(state.scorer.score(&features).await?))
}

/// Create the HTTP router for the audit API.
pub fn create_http_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/score", post(score_features))
        .route("/audits", post(submit_audit).get(list_audits))
        .route("/audits/jobs/:id", get(get_job))
        .route("/audits/jobs/:id/cancel", post(cancel_job))
        .route("/audits/:id", get(get_audit))
        .route("/abis/:network/:address", put(save_abi).get(get_abi))
        .route("/contracts/:network/:address/call/:member", get(call_member))
        .with_state(Arc::new(state))
}
