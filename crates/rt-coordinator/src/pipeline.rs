//! Request admission, hop-by-hop pipelined forwarding, and the final-hop
//! sampling step (§4.7): a single batch-formation event loop feeding a
//! multi-hop `reqwest` RPC chain across the pipeline-parallel worker pool.

use crate::state::{CoordinatorState, OutputHead, PendingStep, RequestRecord, SampleState};
use rt_common::{FinishReason, RequestId, Result, RuntimeError, SamplingParams, SegmentSpan, SeqBatch};
use rt_core::{sampler::sample_top_k_top_p, ClientDescriptor};
use rt_kernels::Tensor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Wire shape of the worker's `Forward` RPC (§6), matching
/// `rt_worker::{ForwardRequest, ForwardResponse}` field-for-field.
#[derive(Serialize)]
struct ForwardRequest<'a> {
    batch: &'a SeqBatch,
    hidden_states: Tensor,
}

#[derive(Deserialize)]
struct ForwardResponse {
    hidden_states: Tensor,
}

#[derive(Serialize)]
struct ForgetRequest<'a> {
    request_id: &'a str,
}

/// Per request, the completions and prompt echoed back to the consumer
/// (§6 "Request outputs").
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutputDto {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<u32>,
    pub completions: Vec<CompletionOutputDto>,
    pub is_stop: bool,
    pub ttft_ms: Option<f64>,
    pub inter_token_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutputDto {
    pub token_ids: Vec<u32>,
    /// Detokenization is out of scope (spec §1 Non-goals); this is a
    /// space-joined rendering of `token_ids` so the wire shape is complete
    /// and testable without a real tokenizer.
    pub text: String,
    pub finish_reason: Option<FinishReason>,
}

pub fn to_dto(request_id: &RequestId, record: &RequestRecord) -> RequestOutputDto {
    let completions = record
        .samples
        .iter()
        .map(|s| CompletionOutputDto {
            token_ids: s.token_ids.clone(),
            text: s.token_ids.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" "),
            finish_reason: s.finish_reason,
        })
        .collect();
    let first = record.samples.first();
    let ttft_ms = first
        .and_then(|s| s.first_token_at)
        .map(|t| t.duration_since(record.created_at).as_secs_f64() * 1000.0);
    let inter_token_latency_ms = first.and_then(|s| match (s.first_token_at, s.last_token_at) {
        (Some(first), Some(last)) if s.token_ids.len() > 1 => {
            Some(last.duration_since(first).as_secs_f64() * 1000.0 / (s.token_ids.len() - 1) as f64)
        }
        _ => None,
    });
    RequestOutputDto {
        request_id: request_id.clone(),
        prompt_token_ids: record.prompt_token_ids.clone(),
        completions,
        is_stop: record.is_stop(),
        ttft_ms,
        inter_token_latency_ms,
    }
}

/// Admits a request (§4.7 `PENDING`): validates a covering path exists,
/// reserves its record, and enqueues one pending prefill step per sample.
pub async fn submit_completion(
    state: &Arc<CoordinatorState>,
    prompt_token_ids: Vec<u32>,
    sampling: SamplingParams,
) -> Result<RequestId> {
    {
        let membership = state.membership.read().await;
        membership.find_continuous_path()?;
    }
    if state.model.read().await.is_none() || state.output_head.read().await.is_none() {
        return Err(RuntimeError::Message("model not initialized".into()));
    }

    let request_id = state.fresh_request_id();
    let n = sampling.n.max(1);
    let record = RequestRecord {
        prompt_token_ids: prompt_token_ids.clone(),
        sampling,
        samples: vec![SampleState::default(); n],
        created_at: Instant::now(),
        cancelled: false,
        metrics_closed: false,
    };
    state.requests.write().await.insert(request_id.clone(), record);
    state.metrics.requests_total.inc();
    state.metrics.requests_active.inc();

    for sample_idx in 0..n {
        let step = PendingStep {
            parent_id: request_id.clone(),
            sample_idx,
            worker_request_id: format!("{request_id}#{sample_idx}"),
            input_token_ids: prompt_token_ids.clone(),
        };
        state
            .step_tx
            .send(step)
            .map_err(|_| RuntimeError::Message("batch loop not running".into()))?;
    }
    Ok(request_id)
}

/// Marks a request cancelled (§5 Cancellation): the batch loop stops
/// re-enqueueing its steps; any RPC already in flight is allowed to
/// complete and its output discarded.
pub async fn cancel_request(state: &Arc<CoordinatorState>, request_id: &RequestId) -> Result<()> {
    let mut requests = state.requests.write().await;
    let record = requests.get_mut(request_id).ok_or_else(|| RuntimeError::UnknownRequest(request_id.clone()))?;
    record.cancelled = true;
    close_metrics_if_done(state, record);
    Ok(())
}

/// The coordinator's single event loop (§5): waits for the next pending
/// step (the batch-formation barrier), drains whatever else is ready up to
/// `max_batch_tokens`, packs them into one hop, and samples the result.
pub async fn run_batch_loop(state: Arc<CoordinatorState>, mut rx: mpsc::UnboundedReceiver<PendingStep>) {
    loop {
        let Some(first) = rx.recv().await else {
            info!("batch loop channel closed, exiting");
            return;
        };
        let mut batch = vec![first];
        let mut tokens = batch[0].input_token_ids.len();
        while tokens < state.config.max_batch_tokens {
            match rx.try_recv() {
                Ok(step) => {
                    tokens += step.input_token_ids.len();
                    batch.push(step);
                }
                Err(_) => break,
            }
        }
        state.metrics.batch_size.set(batch.len() as i64);
        run_batch(&state, batch).await;
    }
}

async fn run_batch(state: &Arc<CoordinatorState>, batch: Vec<PendingStep>) {
    // Drop steps belonging to cancelled/removed requests before doing any work.
    let mut live = Vec::with_capacity(batch.len());
    for step in batch {
        let requests = state.requests.read().await;
        match requests.get(&step.parent_id) {
            Some(r) if !r.cancelled => live.push(step),
            _ => {}
        }
    }
    if live.is_empty() {
        return;
    }

    let path = match state.membership.read().await.find_continuous_path() {
        Ok(p) => p,
        Err(e) => {
            for step in live {
                fail_sample(state, &step, e.clone()).await;
            }
            return;
        }
    };

    let batch = SeqBatch(
        live.iter()
            .map(|s| SegmentSpan {
                request_id: s.worker_request_id.clone(),
                segment_length: s.input_token_ids.len(),
            })
            .collect(),
    );
    let hidden = match embed(state, &live).await {
        Ok(h) => h,
        Err(e) => {
            for step in live {
                fail_sample(state, &step, e.clone()).await;
            }
            return;
        }
    };

    let hidden = match run_hops(state, &path, &batch, hidden).await {
        Ok(h) => h,
        Err(e) => {
            for step in &live {
                fail_sample(state, step, e.clone()).await;
            }
            return;
        }
    };

    let logits = match final_projection(state, &hidden).await {
        Ok(l) => l,
        Err(e) => {
            for step in &live {
                fail_sample(state, step, e.clone()).await;
            }
            return;
        }
    };

    let vocab = logits.row_width();
    for (row, step) in live.into_iter().enumerate() {
        let slice = &logits.data[row * vocab..(row + 1) * vocab];
        apply_sample(state, &path, step, slice).await;
    }
}

async fn embed(state: &Arc<CoordinatorState>, steps: &[PendingStep]) -> Result<Tensor> {
    let guard = state.output_head.read().await;
    let head = guard.as_ref().ok_or_else(|| RuntimeError::Message("output head not set".into()))?;
    let mut rows = Vec::new();
    for step in steps {
        for &id in &step.input_token_ids {
            rows.push(head.embed_tokens_t.row_slice(id as usize, 1)?);
        }
    }
    let refs: Vec<&Tensor> = rows.iter().collect();
    Tensor::cat_rows(&refs)
}

async fn final_projection(state: &Arc<CoordinatorState>, hidden: &Tensor) -> Result<Tensor> {
    let guard = state.output_head.read().await;
    let head = guard.as_ref().ok_or_else(|| RuntimeError::Message("output head not set".into()))?;
    let model = state.model.read().await;
    let model = model.as_ref().ok_or_else(|| RuntimeError::Message("model not set".into()))?;
    let normed = state.kernels.rmsnorm(hidden, &head.final_norm_weight, model.rms_norm_eps)?;
    state.kernels.matmul(&normed, &head.lm_head_t)
}

async fn run_hops(
    state: &Arc<CoordinatorState>,
    path: &[ClientDescriptor],
    batch: &SeqBatch,
    hidden_states: Tensor,
) -> Result<Tensor> {
    let mut hidden = hidden_states;
    for client in path {
        let body = ForwardRequest { batch, hidden_states: hidden };
        let started = Instant::now();
        let resp = state
            .http
            .post(client.forward_url())
            .timeout(state.config.hop_timeout())
            .json(&body)
            .send()
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        state.metrics.hop_latency_seconds.observe(started.elapsed().as_secs_f64());
        if !resp.status().is_success() {
            return Err(RuntimeError::Transport(format!("{} returned {}", client.client_id, resp.status())));
        }
        let parsed: ForwardResponse = resp.json().await.map_err(|e| RuntimeError::Transport(e.to_string()))?;
        hidden = parsed.hidden_states;
    }
    Ok(hidden)
}

async fn apply_sample(state: &Arc<CoordinatorState>, path: &[ClientDescriptor], step: PendingStep, logits: &[f32]) {
    let model = state.model.read().await.clone();
    let Some(model) = model else { return };

    let sampling = {
        let requests = state.requests.read().await;
        match requests.get(&step.parent_id) {
            Some(r) => r.sampling.clone(),
            None => return,
        }
    };
    let seed = sampling.is_greedy().then_some(0);
    let top_k = if sampling.is_greedy() { 1 } else { sampling.top_k };
    let token = sample_top_k_top_p(logits, top_k, sampling.top_p, sampling.temperature.max(1e-4), seed) as u32;

    let stopped = {
        let mut requests = state.requests.write().await;
        let Some(record) = requests.get_mut(&step.parent_id) else { return };
        let now = Instant::now();
        let max_new_tokens = record.sampling.max_new_tokens;
        let sample = &mut record.samples[step.sample_idx];
        if sample.first_token_at.is_none() {
            sample.first_token_at = Some(now);
        }
        sample.last_token_at = Some(now);
        sample.token_ids.push(token);
        state.metrics.tokens_generated_total.inc();
        if model.eos_token_ids.contains(&token) {
            sample.finish_reason = Some(FinishReason::Stop);
        } else if sample.token_ids.len() >= max_new_tokens {
            sample.finish_reason = Some(FinishReason::Length);
        }
        let done = sample.finish_reason.is_some();
        close_metrics_if_done(state, record);
        done
    };

    if stopped {
        forget_everywhere(state, path, &step.worker_request_id).await;
    } else {
        let next = PendingStep {
            parent_id: step.parent_id,
            sample_idx: step.sample_idx,
            worker_request_id: step.worker_request_id,
            input_token_ids: vec![token],
        };
        if state.step_tx.send(next).is_err() {
            warn!("dropped decode step: batch loop not running");
        }
    }
}

async fn fail_sample(state: &Arc<CoordinatorState>, step: &PendingStep, err: RuntimeError) {
    error!(parent_id = %step.parent_id, sample = step.sample_idx, error = %err, "step failed");
    let mut requests = state.requests.write().await;
    if let Some(record) = requests.get_mut(&step.parent_id) {
        record.samples[step.sample_idx].finish_reason = Some(FinishReason::Error);
        close_metrics_if_done(state, record);
    }
}

/// Decrements `requests_active` exactly once, the first time every sample
/// of a request has a terminal `finish_reason` (or the request was
/// cancelled). Guarded by `metrics_closed` so repeated calls — one per
/// sample reaching its own stop condition — don't double-count.
fn close_metrics_if_done(state: &Arc<CoordinatorState>, record: &mut RequestRecord) {
    if !record.metrics_closed && record.is_stop() {
        record.metrics_closed = true;
        state.metrics.requests_active.dec();
    }
}

async fn forget_everywhere(state: &Arc<CoordinatorState>, path: &[ClientDescriptor], worker_request_id: &str) {
    for client in path {
        let url = format!("http://{}:{}/forget", client.host, client.port);
        let body = ForgetRequest { request_id: worker_request_id };
        if let Err(e) = state.http.post(url).json(&body).send().await {
            warn!(client_id = %client.client_id, error = %e, "best-effort forget failed");
        }
    }
}
