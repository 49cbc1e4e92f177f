//! The coordinator HTTP surface (§6): cluster membership
//! (`/register_client`, `/init_model`), liveness (`/health`), model
//! loading (`/admin/set_model`), and the consumer-facing completion API
//! (`/v1/completions`, `/v1/requests/{request_id}`), backed by a membership
//! table plus a pipelined multi-worker forward path.

pub mod heartbeat;
pub mod membership;
pub mod pipeline;
pub mod split;
pub mod state;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use once_cell::sync::Lazy;
use prometheus::{Encoder, TextEncoder};
use rt_common::{RequestId, RuntimeConfig, RuntimeError, SamplingParams};
use rt_core::{LayerWeights, ModelDescriptor};
use rt_kernels::Tensor;
use rt_kernels_cpu::CpuKernels;
use serde::{Deserialize, Serialize};
use state::{CoordinatorState, OutputHead};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

#[derive(Clone)]
pub struct AppState {
    inner: Arc<CoordinatorState>,
}

impl AppState {
    /// Builds the coordinator state for a cluster targeting `total_layers`
    /// decoder layers split across `pipeline_stages` fixed slots, and
    /// spawns its background batch loop, heartbeat sweep, and observability
    /// pollers.
    pub fn new(total_layers: usize, pipeline_stages: usize, config: RuntimeConfig) -> Self {
        rt_obs::init();
        rt_obs::spawn_system_polling();
        rt_obs::spawn_gpu_polling();
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(CoordinatorState::new(
            total_layers,
            pipeline_stages,
            config,
            Arc::new(CpuKernels::new()),
            tx,
        ));
        tokio::spawn(pipeline::run_batch_loop(inner.clone(), rx));
        tokio::spawn(heartbeat::run_heartbeat_sweep(inner.clone()));
        Self { inner }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/register_client", post(register_client))
        .route("/init_model", post(init_model))
        .route("/heartbeat", post(heartbeat_ping))
        .route("/admin/set_model", post(admin_set_model))
        .route("/v1/completions", post(completions))
        .route("/v1/requests/{request_id}", get(get_request).delete(cancel_request))
        .with_state(state.inner)
}

async fn health() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    ENCODER.encode(&metric_families, &mut buffer).expect("prometheus encode");
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

/// A client omits `pp_rank`/`start_idx`/`end_idx` on its first connection
/// (a free slot is assigned to it) and supplies them back on every
/// subsequent re-registration, re-occupying its existing fixed slot.
#[derive(Debug, Deserialize)]
struct RegisterClientRequest {
    client_id: String,
    host: String,
    port: u16,
    #[serde(default)]
    pp_rank: Option<usize>,
    #[serde(default)]
    start_idx: Option<usize>,
    #[serde(default)]
    end_idx: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RegisterClientResponse {
    pp_rank: usize,
    start_idx: Option<usize>,
    end_idx: Option<usize>,
    model: Option<ModelDescriptor>,
    msg: String,
}

async fn register_client(
    State(state): State<Arc<CoordinatorState>>,
    Json(req): Json<RegisterClientRequest>,
) -> Result<Json<RegisterClientResponse>, ApiError> {
    let reconnect = match (req.pp_rank, req.start_idx, req.end_idx) {
        (Some(rank), Some(start), Some(end)) => Some((rank, start, end)),
        _ => None,
    };
    let mut membership = state.membership.write().await;
    let reg = membership
        .register_client(req.client_id.clone(), req.host, req.port, reconnect)
        .await
        .map_err(ApiError)?;
    let pp_rank = membership.pp_rank_of(&req.client_id);
    drop(membership);
    info!(client_id = %req.client_id, pp_rank, "client registered");
    let model = state.model.read().await.clone();
    Ok(Json(RegisterClientResponse {
        pp_rank,
        start_idx: reg.client.layer_range.map(|r| r.start),
        end_idx: reg.client.layer_range.map(|r| r.end),
        model,
        msg: "registered".into(),
    }))
}

#[derive(Debug, Deserialize)]
struct InitModelRequest {
    client_id: String,
    pp_rank: usize,
    start_idx: usize,
    end_idx: usize,
}

#[derive(Debug, Serialize)]
struct InitModelResponse {
    msg: String,
    status: String,
}

/// Finalizes a registered client's assignment (spec.md's `init_client`,
/// exposed as `POST /init_model` per §6) by slicing this coordinator's held
/// layer weights and pushing them to the worker's `SetConfig` RPC.
async fn init_model(
    State(state): State<Arc<CoordinatorState>>,
    Json(req): Json<InitModelRequest>,
) -> Result<Json<InitModelResponse>, ApiError> {
    let client = {
        let membership = state.membership.read().await;
        membership.get(&req.client_id).cloned().ok_or_else(|| RuntimeError::UnknownRequest(req.client_id.clone()))
    }
    .map_err(ApiError)?;

    let model =
        state.model.read().await.clone().ok_or_else(|| RuntimeError::Message("model not loaded".into())).map_err(ApiError)?;
    let layer_weights = state
        .layer_weights
        .read()
        .await
        .clone()
        .ok_or_else(|| RuntimeError::Message("model not loaded".into()))
        .map_err(ApiError)?;
    let slice = layer_weights
        .get(req.start_idx..req.end_idx)
        .ok_or_else(|| RuntimeError::ShapeError("layer range out of bounds".into()))
        .map_err(ApiError)?
        .to_vec();

    let body = WorkerSetConfigRequest {
        master_url: String::new(),
        forward_url: None,
        pp_rank: req.pp_rank,
        tp_world_size: state.tp_world_size,
        layer_range: rt_core::LayerRange::new(req.start_idx, req.end_idx),
        model,
        layer_weights: slice,
    };
    let resp = state
        .http
        .post(client.set_config_url())
        .timeout(state.config.hop_timeout())
        .json(&body)
        .send()
        .await
        .map_err(|e| RuntimeError::Transport(e.to_string()))
        .map_err(ApiError)?;
    if !resp.status().is_success() {
        return Err(ApiError(RuntimeError::Transport(format!("set_config returned {}", resp.status()))));
    }
    info!(client_id = %req.client_id, start = req.start_idx, end = req.end_idx, "client initialized");
    Ok(Json(InitModelResponse { msg: "configured".into(), status: "ok".into() }))
}

/// Mirrors `rt_worker::SetConfigRequest` field-for-field for the outbound RPC.
#[derive(Serialize)]
struct WorkerSetConfigRequest {
    master_url: String,
    forward_url: Option<String>,
    pp_rank: usize,
    tp_world_size: usize,
    layer_range: rt_core::LayerRange,
    model: ModelDescriptor,
    layer_weights: Vec<LayerWeights>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    client_id: String,
}

async fn heartbeat_ping(State(state): State<Arc<CoordinatorState>>, Json(req): Json<HeartbeatRequest>) -> impl IntoResponse {
    state.membership.write().await.touch(&req.client_id);
    axum::http::StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct AdminSetModelRequest {
    model: ModelDescriptor,
    embed_tokens_t: Tensor,
    final_norm_weight: Vec<f32>,
    lm_head_t: Tensor,
    layer_weights: Vec<LayerWeights>,
}

async fn admin_set_model(
    State(state): State<Arc<CoordinatorState>>,
    Json(req): Json<AdminSetModelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.layer_weights.len() != req.model.num_layers {
        return Err(ApiError(RuntimeError::ShapeError(format!(
            "expected {} layers of weights, got {}",
            req.model.num_layers,
            req.layer_weights.len()
        ))));
    }
    *state.model.write().await = Some(req.model);
    *state.output_head.write().await = Some(OutputHead {
        embed_tokens_t: req.embed_tokens_t,
        final_norm_weight: req.final_norm_weight,
        lm_head_t: req.lm_head_t,
    });
    *state.layer_weights.write().await = Some(req.layer_weights);
    Ok((axum::http::StatusCode::OK, "ok"))
}

#[derive(Debug, Deserialize)]
struct CompletionsRequest {
    prompt_token_ids: Vec<u32>,
    #[serde(default)]
    sampling_params: SamplingParams,
}

/// Blocks until the request stops (EOS, length, or cancel), per spec.md's
/// explicit choice not to specify a streaming transport.
async fn completions(
    State(state): State<Arc<CoordinatorState>>,
    Json(req): Json<CompletionsRequest>,
) -> Result<Json<pipeline::RequestOutputDto>, ApiError> {
    let request_id = pipeline::submit_completion(&state, req.prompt_token_ids, req.sampling_params).await.map_err(ApiError)?;
    loop {
        {
            let requests = state.requests.read().await;
            if let Some(record) = requests.get(&request_id) {
                if record.is_stop() {
                    return Ok(Json(pipeline::to_dto(&request_id, record)));
                }
            } else {
                return Err(ApiError(RuntimeError::UnknownRequest(request_id)));
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn get_request(
    State(state): State<Arc<CoordinatorState>>,
    Path(request_id): Path<RequestId>,
) -> Result<Json<pipeline::RequestOutputDto>, ApiError> {
    let requests = state.requests.read().await;
    let record = requests.get(&request_id).ok_or_else(|| RuntimeError::UnknownRequest(request_id.clone()))?;
    Ok(Json(pipeline::to_dto(&request_id, record)))
}

async fn cancel_request(
    State(state): State<Arc<CoordinatorState>>,
    Path(request_id): Path<RequestId>,
) -> Result<impl IntoResponse, ApiError> {
    pipeline::cancel_request(&state, &request_id).await.map_err(ApiError)?;
    Ok((axum::http::StatusCode::OK, "cancelled"))
}

struct ApiError(RuntimeError);

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        tracing::error!(error = %self.0, "coordinator request failed");
        let status = match self.0 {
            RuntimeError::UnknownRequest(_) => axum::http::StatusCode::NOT_FOUND,
            RuntimeError::NoCoveringPath => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            _ => axum::http::StatusCode::BAD_REQUEST,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
