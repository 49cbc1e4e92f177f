//! Tensor-parallel causal self-attention sublayer (§4.3): fused QKV
//! projection, rotary embedding, grouped-query `repeat_kv`, scaled-dot-
//! product attention, row-parallel output projection with all-reduce.
//!
//! Every tensor-parallel rank of a group is co-located in this process
//! (§9 Design Notes), so `forward` simply loops ranks and all-reduces their
//! partial outputs rather than dispatching to separate threads.

use crate::cache::RequestsCache;
use crate::ops::repeat_kv;
use crate::rope::RopeCache;
use rt_common::{RequestId, Result};
use rt_kernels::{FusedParallelLinear, Kernels, RowParallelLinear, Tensor, TpGroup};

pub struct CausalSelfAttention {
    qkv: Vec<FusedParallelLinear>,
    o_proj: Vec<RowParallelLinear>,
    group: TpGroup,
    num_attention_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    pub fn shard(
        q_proj_t: &Tensor,
        k_proj_t: &Tensor,
        v_proj_t: &Tensor,
        o_proj_t: &Tensor,
        num_attention_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        group: TpGroup,
    ) -> Result<Self> {
        let col_sizes = [
            num_attention_heads * head_dim,
            num_kv_heads * head_dim,
            num_kv_heads * head_dim,
        ];
        let fused_weight = Tensor::cat_rows(&[q_proj_t, k_proj_t, v_proj_t])?;
        let mut qkv = Vec::with_capacity(group.world_size);
        let mut o_proj = Vec::with_capacity(group.world_size);
        for rank in 0..group.world_size {
            qkv.push(FusedParallelLinear::shard(&fused_weight, &col_sizes, group, rank)?);
            o_proj.push(RowParallelLinear::shard(o_proj_t, group, rank)?);
        }
        Ok(Self { qkv, o_proj, group, num_attention_heads, num_kv_heads, head_dim })
    }

    /// `hidden: [sum(q_len), hidden_size]`. Appends this layer's new K/V
    /// onto `cache` for every tensor-parallel rank before attending, and
    /// returns `[sum(q_len), hidden_size]`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden: &Tensor,
        layer_idx: usize,
        request_ids: &[RequestId],
        segment_lengths: &[usize],
        known: &[bool],
        position_ids: &[u32],
        rope: &RopeCache,
        cache: &mut RequestsCache,
        kernels: &dyn Kernels,
    ) -> Result<Tensor> {
        let (cos, sin) = rope.gather(position_ids);
        let local_heads = self.num_attention_heads / self.group.world_size;
        let local_kv_heads = self.num_kv_heads / self.group.world_size;
        let n_rep = local_heads / local_kv_heads.max(1);

        let mut partials = Vec::with_capacity(self.group.world_size);
        for rank in 0..self.group.world_size {
            let qkv_out = self.qkv[rank].forward(hidden, kernels)?;
            let parts = self.qkv[rank].split_output(&qkv_out)?;
            let (q, k, v) = (&parts[0], &parts[1], &parts[2]);

            let q = kernels.apply_rope(q, &cos, &sin, local_heads)?;
            let k = kernels.apply_rope(k, &cos, &sin, local_kv_heads)?;

            let (full_k, full_v, rank_spans) =
                cache.update(layer_idx, rank, request_ids, segment_lengths, known, &k, v)?;
            let k_rep = repeat_kv(&full_k, local_kv_heads, n_rep, self.head_dim)?;
            let v_rep = repeat_kv(&full_v, local_kv_heads, n_rep, self.head_dim)?;

            let attn_out =
                kernels.causal_attention(&q, &k_rep, &v_rep, &rank_spans, local_heads, self.head_dim)?;
            partials.push(self.o_proj[rank].forward_partial(&attn_out, kernels)?);
        }
        if partials.len() == 1 {
            Ok(partials.into_iter().next().unwrap())
        } else {
            kernels.all_reduce_sum(&partials)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_kernels_cpu::CpuKernels;

    fn identity_weight(out: usize, inp: usize) -> Tensor {
        let mut data = vec![0.0f32; out * inp];
        for i in 0..out.min(inp) {
            data[i * inp + i] = 1.0;
        }
        Tensor::from_vec(&[out, inp], data).unwrap()
    }

    #[test]
    fn single_rank_matches_world_size_one_bypass() {
        let head_dim = 2;
        let num_heads = 1;
        let hidden = head_dim * num_heads;
        let attn = CausalSelfAttention::shard(
            &identity_weight(hidden, hidden),
            &identity_weight(hidden, hidden),
            &identity_weight(hidden, hidden),
            &identity_weight(hidden, hidden),
            num_heads,
            num_heads,
            head_dim,
            TpGroup::new(1),
        )
        .unwrap();
        let kernels = CpuKernels::new();
        let rope = RopeCache::new(head_dim, 10000.0, 16);
        let mut cache = RequestsCache::new();
        let hidden_in = Tensor::from_vec(&[1, hidden], vec![1.0, 0.0]).unwrap();
        let out = attn
            .forward(
                &hidden_in,
                0,
                &["r1".to_string()],
                &[1],
                &[false],
                &[0],
                &rope,
                &mut cache,
                &kernels,
            )
            .unwrap();
        assert_eq!(out.shape, vec![1, hidden]);
    }
}
