//! The worker inference engine (§4.6): an explicitly constructed and torn
//! down object owning one contiguous `LayerRange`'s transformer blocks,
//! with no implicit global or process-lifetime state (§9 Design Notes).
//!
//! Walks the owned layers in order, updating the KV cache as each attends,
//! with no knowledge of layers outside the owned range.

use crate::block::{LayerWeights, TransformerBlock};
use crate::cache::CacheManager;
use crate::descriptor::{LayerRange, ModelDescriptor};
use crate::rope::RopeCache;
use rt_common::{RequestId, Result, RuntimeError};
use rt_kernels::{Kernels, Tensor, TpGroup};
use std::sync::Arc;
use tracing::{debug, info};

pub struct WorkerEngine {
    layer_range: LayerRange,
    total_layers: usize,
    blocks: Vec<TransformerBlock>,
    cache: CacheManager,
    rope: RopeCache,
    kernels: Arc<dyn Kernels>,
}

impl WorkerEngine {
    /// Builds the engine for `layer_range`, sharding every owned layer's
    /// weights across `group`. `layer_weights` must be ordered to match
    /// `layer_range` (i.e. `layer_weights[i]` holds the weights for layer
    /// `layer_range.start + i`).
    pub fn new(
        model: &ModelDescriptor,
        layer_range: LayerRange,
        layer_weights: Vec<LayerWeights>,
        group: TpGroup,
        kernels: Arc<dyn Kernels>,
    ) -> Result<Self> {
        if layer_weights.len() != layer_range.len() {
            return Err(RuntimeError::ShapeError(format!(
                "engine given {} layer weight sets for a range of length {}",
                layer_weights.len(),
                layer_range.len()
            )));
        }
        let blocks = layer_weights
            .into_iter()
            .enumerate()
            .map(|(i, w)| TransformerBlock::new(layer_range.start + i, w, model, group))
            .collect::<Result<Vec<_>>>()?;
        let rope = RopeCache::new(model.head_dim, model.rope_theta, model.max_position_embeddings);
        info!(start = layer_range.start, end = layer_range.end, "worker engine constructed");
        Ok(Self {
            layer_range,
            total_layers: model.num_layers,
            blocks,
            cache: CacheManager::new(),
            rope,
            kernels,
        })
    }

    pub fn layer_range(&self) -> LayerRange {
        self.layer_range
    }

    /// True when this engine owns the last decoder layer, the point at
    /// which `forward` truncates to one row per request for sampling (§4.6
    /// step 3).
    pub fn owns_final_layer(&self) -> bool {
        self.layer_range.end == self.total_layers
    }

    /// Runs `hidden_states` through every owned layer in order, updating
    /// each request's KV cache as it goes. `request_ids`/`segment_lengths`
    /// describe the packed batch and must stay in lockstep across hops
    /// (§3 invariant); position ids for each request are derived from this
    /// engine's own cache state at the first owned layer.
    pub fn forward(
        &mut self,
        request_ids: &[RequestId],
        segment_lengths: &[usize],
        hidden_states: Tensor,
    ) -> Result<Tensor> {
        if request_ids.len() != segment_lengths.len() {
            return Err(RuntimeError::ShapeError(
                "forward: request_ids and segment_lengths length mismatch".into(),
            ));
        }
        let total: usize = segment_lengths.iter().sum();
        if hidden_states.rows() != total {
            return Err(RuntimeError::ShapeError(format!(
                "forward: hidden_states has {} rows, segment_lengths sum to {}",
                hidden_states.rows(),
                total
            )));
        }

        let position_ids = self.position_ids(request_ids, segment_lengths);
        // Captured before this hop's blocks run (and before `touch` below),
        // so a request's legitimate first hop here is `false` and a
        // continuing request missing its prior entry is `true` — the
        // latter surfaces as `UnknownRequest` instead of silently
        // restarting the request's history from empty.
        let known: Vec<bool> = request_ids.iter().map(|id| self.cache.is_touched(id)).collect();
        let mut hidden = hidden_states;
        for block in &mut self.blocks {
            hidden = block.forward(
                &hidden,
                request_ids,
                segment_lengths,
                &known,
                &position_ids,
                &self.rope,
                self.cache.requests_mut(),
                self.kernels.as_ref(),
            )?;
        }
        for id in request_ids {
            self.cache.touch(id);
        }
        if self.owns_final_layer() {
            hidden = Self::last_row_per_request(&hidden, segment_lengths)?;
        }
        debug!(rows = hidden.rows(), "engine forward step complete");
        Ok(hidden)
    }

    /// Keeps only the last packed row of each request's segment, in
    /// request order (§4.6 step 3: the final worker only needs the most
    /// recent token's hidden state to produce next-token logits).
    fn last_row_per_request(hidden: &Tensor, segment_lengths: &[usize]) -> Result<Tensor> {
        let mut offset = 0;
        let mut rows = Vec::with_capacity(segment_lengths.len());
        for &len in segment_lengths {
            rows.push(hidden.row_slice(offset + len - 1, 1)?);
            offset += len;
        }
        let refs: Vec<&Tensor> = rows.iter().collect();
        Tensor::cat_rows(&refs)
    }

    fn position_ids(&self, request_ids: &[RequestId], segment_lengths: &[usize]) -> Vec<u32> {
        let mut ids = Vec::with_capacity(segment_lengths.iter().sum());
        for (request_id, &seg_len) in request_ids.iter().zip(segment_lengths) {
            let past = self.cache.requests().get_seq_len(request_id, self.layer_range.start, 0);
            for p in past..past + seg_len {
                ids.push(p as u32);
            }
        }
        ids
    }

    pub fn evict_stale(&mut self, max_alive: std::time::Duration) -> Vec<RequestId> {
        self.cache.check_alive(max_alive)
    }

    pub fn forget(&mut self, request_id: &RequestId) {
        self.cache.delete(request_id);
    }

    /// Explicit teardown: drops every owned block and its cache. Exists so
    /// callers can log and release resources deterministically instead of
    /// relying on implicit `Drop` ordering of a long-lived global.
    pub fn shutdown(self) {
        info!(start = self.layer_range.start, end = self.layer_range.end, "worker engine shut down");
    }
}
