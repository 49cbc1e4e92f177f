//! Coordinator-wide shared state (§4.7, §4.8): cluster membership, the
//! output head applied after the last worker hop, and the in-flight
//! request table, all behind `Arc<RwLock<..>>` so handlers can share one
//! state without a global lock around the whole request.

use crate::membership::MembershipService;
use crate::metrics::CoordinatorMetrics;
use rt_common::{FinishReason, RequestId, RuntimeConfig, SamplingParams};
use rt_core::{LayerWeights, ModelDescriptor};
use rt_kernels::{Kernels, Tensor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};

/// Embedding table, final RMSNorm weight, and output projection applied
/// once the last pipeline hop returns (§4.7 step 4). Loaded at coordinator
/// construction time, alongside `ModelDescriptor` — weight-file parsing
/// itself is out of scope, so callers hand in already-decoded tensors.
pub struct OutputHead {
    pub embed_tokens_t: Tensor,
    pub final_norm_weight: Vec<f32>,
    pub lm_head_t: Tensor,
}

#[derive(Debug, Clone, Default)]
pub struct SampleState {
    pub token_ids: Vec<u32>,
    pub finish_reason: Option<FinishReason>,
    pub first_token_at: Option<Instant>,
    pub last_token_at: Option<Instant>,
}

/// One admitted request's lifecycle state (§3, §4.7 state machine). Each
/// sample (`SamplingParams::n`) runs its own prefill/decode loop against a
/// distinct worker-side cache key, `"{request_id}#{sample_idx}"`.
pub struct RequestRecord {
    pub prompt_token_ids: Vec<u32>,
    pub sampling: SamplingParams,
    pub samples: Vec<SampleState>,
    pub created_at: Instant,
    pub cancelled: bool,
    /// Set once `requests_active` has been decremented for this request, so
    /// repeated stop checks (e.g. one per sample) don't double-count it.
    pub metrics_closed: bool,
}

impl RequestRecord {
    pub fn is_stop(&self) -> bool {
        self.cancelled || self.samples.iter().all(|s| s.finish_reason.is_some())
    }
}

/// One sample's step, ready to be packed into the next batch (§4.7 steps
/// 1–2). Re-enqueued by the batch loop after each non-terminal step, which
/// is what gives pipelining across concurrent requests "for free" — a
/// request's step `s+1` goes back on the queue the instant step `s`
/// finishes, without waiting on any other request.
pub struct PendingStep {
    pub parent_id: RequestId,
    pub sample_idx: usize,
    pub worker_request_id: RequestId,
    pub input_token_ids: Vec<u32>,
}

pub struct CoordinatorState {
    pub config: RuntimeConfig,
    pub membership: RwLock<MembershipService>,
    pub model: RwLock<Option<ModelDescriptor>>,
    pub output_head: RwLock<Option<OutputHead>>,
    /// The full model's per-layer weights, sliced out to each worker's
    /// owned range at `/init_model` time (weight-file parsing itself is
    /// out of scope; callers hand in already-decoded per-layer weights).
    pub layer_weights: RwLock<Option<Vec<LayerWeights>>>,
    pub tp_world_size: usize,
    pub kernels: Arc<dyn Kernels>,
    pub http: reqwest::Client,
    pub requests: RwLock<HashMap<RequestId, RequestRecord>>,
    pub step_tx: mpsc::UnboundedSender<PendingStep>,
    pub metrics: CoordinatorMetrics,
    next_request_id: AtomicU64,
}

impl CoordinatorState {
    pub fn new(
        total_layers: usize,
        pipeline_stages: usize,
        config: RuntimeConfig,
        kernels: Arc<dyn Kernels>,
        step_tx: mpsc::UnboundedSender<PendingStep>,
    ) -> Self {
        Self {
            config,
            membership: RwLock::new(MembershipService::new(total_layers, pipeline_stages)),
            model: RwLock::new(None),
            output_head: RwLock::new(None),
            layer_weights: RwLock::new(None),
            tp_world_size: 1,
            kernels,
            http: reqwest::Client::new(),
            requests: RwLock::new(HashMap::new()),
            step_tx,
            metrics: CoordinatorMetrics::new(),
            next_request_id: AtomicU64::new(0),
        }
    }

    pub fn fresh_request_id(&self) -> RequestId {
        format!("req-{}", self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }
}
