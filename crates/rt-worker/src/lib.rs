//! The worker RPC surface (§6): `POST /forward` and `POST /set_config`,
//! hosting one `rt-core` engine instance per process. The worker owns one
//! pipeline-parallel layer range and is (re)configured by the coordinator
//! at startup.

use axum::{extract::State, response::IntoResponse, routing::{get, post}, Json, Router};
use once_cell::sync::Lazy;
use prometheus::{Encoder, TextEncoder};
use rt_common::{RequestId, RuntimeConfig, RuntimeError, SeqBatch};
use rt_core::descriptor::{LayerRange, ModelDescriptor};
use rt_core::{LayerWeights, WorkerEngine};
use rt_kernels::{Kernels, Tensor, TpGroup};
use rt_kernels_cpu::CpuKernels;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

struct Configured {
    engine: WorkerEngine,
    pp_rank: usize,
    master_url: String,
    forward_url: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<Option<Configured>>>,
    kernels: Arc<dyn Kernels>,
}

impl AppState {
    /// Builds worker state and spawns its observability pollers plus a
    /// periodic sweep that evicts KV cache entries idle past
    /// `config.max_alive_time()`, mirroring the coordinator's heartbeat
    /// sweep task.
    pub fn new(config: RuntimeConfig) -> Self {
        rt_obs::init();
        rt_obs::spawn_system_polling();
        rt_obs::spawn_gpu_polling();
        let inner = Arc::new(RwLock::new(None));
        tokio::spawn(run_eviction_sweep(inner.clone(), config));
        Self { inner, kernels: Arc::new(CpuKernels::new()) }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

/// Ticks every `config.ping_interval()` and evicts this worker's requests
/// idle past `config.max_alive_time()`, grounded on `CacheManager.check_alive`
/// — the same sweep the coordinator runs over client heartbeats, applied
/// here to per-request KV cache liveness instead.
async fn run_eviction_sweep(state: Arc<RwLock<Option<Configured>>>, config: RuntimeConfig) {
    let mut interval = tokio::time::interval(config.ping_interval());
    loop {
        interval.tick().await;
        let mut guard = state.write().await;
        if let Some(configured) = guard.as_mut() {
            let evicted = configured.engine.evict_stale(config.max_alive_time());
            if !evicted.is_empty() {
                info!(count = evicted.len(), "evicted stale request caches");
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/set_config", post(set_config))
        .route("/forward", post(forward))
        .route("/forget", post(forget))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    configured: bool,
    pp_rank: Option<usize>,
    layer_range: Option<LayerRange>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let guard = state.inner.read().await;
    match guard.as_ref() {
        Some(c) => Json(HealthResponse {
            configured: true,
            pp_rank: Some(c.pp_rank),
            layer_range: Some(c.engine.layer_range()),
        }),
        None => Json(HealthResponse { configured: false, pp_rank: None, layer_range: None }),
    }
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    ENCODER.encode(&metric_families, &mut buffer).expect("prometheus encode");
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

/// Body of the coordinator's `SetConfig` RPC (§6): assigns this worker its
/// layer range, weights, master URL, and pipeline rank. Safe to call again
/// later to reassign a running worker (§4.8 dynamic reassignment).
#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub master_url: String,
    pub forward_url: Option<String>,
    pub pp_rank: usize,
    pub tp_world_size: usize,
    pub layer_range: LayerRange,
    pub model: ModelDescriptor,
    pub layer_weights: Vec<LayerWeights>,
}

#[derive(Debug, Serialize)]
pub struct SetConfigResponse {
    pub ok: bool,
}

async fn set_config(
    State(state): State<AppState>,
    Json(req): Json<SetConfigRequest>,
) -> Result<Json<SetConfigResponse>, ApiError> {
    let engine = WorkerEngine::new(
        &req.model,
        req.layer_range,
        req.layer_weights,
        TpGroup::new(req.tp_world_size),
        state.kernels.clone(),
    )
    .map_err(ApiError)?;

    let mut guard = state.inner.write().await;
    if let Some(prev) = guard.take() {
        prev.engine.shutdown();
    }
    info!(pp_rank = req.pp_rank, start = req.layer_range.start, end = req.layer_range.end, "reconfigured");
    *guard = Some(Configured {
        engine,
        pp_rank: req.pp_rank,
        master_url: req.master_url,
        forward_url: req.forward_url,
    });
    Ok(Json(SetConfigResponse { ok: true }))
}

/// Body of the coordinator's `Forward` RPC (§6): one packed-batch hop
/// through this worker's owned layer range.
#[derive(Debug, Deserialize)]
pub struct ForwardRequest {
    pub batch: SeqBatch,
    pub hidden_states: Tensor,
}

#[derive(Debug, Serialize)]
pub struct ForwardResponse {
    pub hidden_states: Tensor,
}

async fn forward(
    State(state): State<AppState>,
    Json(req): Json<ForwardRequest>,
) -> Result<Json<ForwardResponse>, ApiError> {
    let mut guard = state.inner.write().await;
    let Some(configured) = guard.as_mut() else {
        return Err(ApiError(RuntimeError::Message("worker not configured".into())));
    };
    let _ = (&configured.master_url, &configured.forward_url);
    let request_ids: Vec<RequestId> = req.batch.request_ids().cloned().collect();
    let segment_lengths: Vec<usize> = req.batch.segment_lengths().collect();
    let hidden_states = configured
        .engine
        .forward(&request_ids, &segment_lengths, req.hidden_states)
        .map_err(ApiError)?;
    Ok(Json(ForwardResponse { hidden_states }))
}

/// Body of the coordinator's best-effort cache eviction call on request
/// stop/cancellation (§5 Cancellation).
#[derive(Debug, Deserialize)]
pub struct ForgetRequest {
    pub request_id: RequestId,
}

#[derive(Debug, Serialize)]
pub struct ForgetResponse {
    pub ok: bool,
}

async fn forget(
    State(state): State<AppState>,
    Json(req): Json<ForgetRequest>,
) -> Result<Json<ForgetResponse>, ApiError> {
    let mut guard = state.inner.write().await;
    if let Some(configured) = guard.as_mut() {
        configured.engine.forget(&req.request_id);
    }
    Ok(Json(ForgetResponse { ok: true }))
}

struct ApiError(RuntimeError);

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        error!(error = %self.0, "forward request failed");
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (axum::http::StatusCode::BAD_REQUEST, body).into_response()
    }
}
