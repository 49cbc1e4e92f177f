//! One decoder layer (§4.5): RMSNorm → self-attention → residual, RMSNorm →
//! MLP → residual.

use crate::attention::CausalSelfAttention;
use crate::cache::RequestsCache;
use crate::descriptor::ModelDescriptor;
use crate::mlp::Mlp;
use crate::ops::add;
use crate::rope::RopeCache;
use rt_common::{RequestId, Result};
use rt_kernels::{Kernels, Tensor, TpGroup};
use serde::{Deserialize, Serialize};

/// The raw weight matrices one decoder layer needs, already transposed to
/// `[out_features, in_features]` row-major layout (the shape `matmul`
/// expects for its `w_t` argument).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerWeights {
    pub input_layernorm_weight: Vec<f32>,
    pub q_proj_t: Tensor,
    pub k_proj_t: Tensor,
    pub v_proj_t: Tensor,
    pub o_proj_t: Tensor,
    pub post_attention_layernorm_weight: Vec<f32>,
    pub gate_proj_t: Tensor,
    pub up_proj_t: Tensor,
    pub down_proj_t: Tensor,
}

pub struct TransformerBlock {
    pub layer_idx: usize,
    input_layernorm_weight: Vec<f32>,
    self_attn: CausalSelfAttention,
    post_attention_layernorm_weight: Vec<f32>,
    mlp: Mlp,
    eps: f32,
}

impl TransformerBlock {
    pub fn new(
        layer_idx: usize,
        weights: LayerWeights,
        model: &ModelDescriptor,
        group: TpGroup,
    ) -> Result<Self> {
        let self_attn = CausalSelfAttention::shard(
            &weights.q_proj_t,
            &weights.k_proj_t,
            &weights.v_proj_t,
            &weights.o_proj_t,
            model.num_attention_heads,
            model.num_kv_heads,
            model.head_dim,
            group,
        )?;
        let mlp = Mlp::shard(
            &weights.gate_proj_t,
            &weights.up_proj_t,
            &weights.down_proj_t,
            model.intermediate_size,
            group,
        )?;
        Ok(Self {
            layer_idx,
            input_layernorm_weight: weights.input_layernorm_weight,
            self_attn,
            post_attention_layernorm_weight: weights.post_attention_layernorm_weight,
            mlp,
            eps: model.rms_norm_eps,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden: &Tensor,
        request_ids: &[RequestId],
        segment_lengths: &[usize],
        known: &[bool],
        position_ids: &[u32],
        rope: &RopeCache,
        cache: &mut RequestsCache,
        kernels: &dyn Kernels,
    ) -> Result<Tensor> {
        let normed = kernels.rmsnorm(hidden, &self.input_layernorm_weight, self.eps)?;
        let attn_out = self.self_attn.forward(
            &normed,
            self.layer_idx,
            request_ids,
            segment_lengths,
            known,
            position_ids,
            rope,
            cache,
            kernels,
        )?;
        let hidden = add(hidden, &attn_out)?;

        let normed = kernels.rmsnorm(&hidden, &self.post_attention_layernorm_weight, self.eps)?;
        let mlp_out = self.mlp.forward(&normed, kernels)?;
        add(&hidden, &mlp_out)
    }
}
