//! The capability-set backend trait (§9 Design Notes): a fixed set of
//! numeric primitives a worker's transformer stack is built from, injected
//! at engine construction instead of selected through runtime polymorphism
//! on a dynamic weight-key tree.
//!
//! Covers the tensor-level operations a decoder-only transformer stack
//! performs against an opaque backend: matmul, RMSNorm, RoPE, causal
//! attention, SiLU, all-reduce.

use crate::tensor::Tensor;
use rt_common::Result;

/// One request's span within a packed attention input: how many new query
/// rows it contributes this step, and how many key/value rows (its full
/// cached history, including the new ones) it attends over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttnSpan {
    pub q_len: usize,
    pub kv_len: usize,
}

pub trait Kernels: Send + Sync {
    /// `x: [n, k]`, `w_t: [m, k]` (row-major, already transposed weight) -> `[n, m]`.
    fn matmul(&self, x: &Tensor, w_t: &Tensor) -> Result<Tensor>;

    /// Row-wise RMSNorm: `x: [n, d]`, `weight: [d]` -> `[n, d]`.
    fn rmsnorm(&self, x: &Tensor, weight: &[f32], eps: f32) -> Result<Tensor>;

    fn silu(&self, x: &Tensor) -> Tensor;

    /// Rotates each `head_dim`-wide head of `x: [n, num_heads * head_dim]` by
    /// the per-position `cos`/`sin: [n, head_dim]` tables, using the
    /// split-half convention (`rotate_half`) rather than interleaved pairs.
    fn apply_rope(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, num_heads: usize) -> Result<Tensor>;

    /// Scaled dot-product attention over a packed, block-diagonal batch.
    /// `q: [sum(q_len), num_heads * head_dim]`, `k`/`v: [sum(kv_len),
    /// num_heads * head_dim]` (grouped-query expansion already applied),
    /// spans given in the same request order as the packed rows. A request
    /// with `q_len == 1` is a pure decode step and skips causal masking
    /// entirely since its single query attends to the whole of its history.
    fn causal_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        spans: &[AttnSpan],
        num_heads: usize,
        head_dim: usize,
    ) -> Result<Tensor>;

    /// Sums same-shaped partial tensors produced by parallel ranks. The
    /// in-process reference backend co-locates every rank of a tensor
    /// parallel group and performs this as a local fold; a networked
    /// deployment would instead run ranks as separate threads or processes
    /// synchronized by a real all-reduce over this same fixed group. A
    /// group of one rank never calls this — see `TpGroup::is_trivial`.
    fn all_reduce_sum(&self, shards: &[Tensor]) -> Result<Tensor>;
}

/// The fixed, locally co-located set of tensor-parallel ranks a sharded
/// linear layer divides its weight across (§9 Design Notes: "a primitive
/// all-reduce abstraction over a fixed, locally co-located worker group",
/// replacing the original's actor fan-out with manual `ray.get`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpGroup {
    pub world_size: usize,
}

impl TpGroup {
    pub fn new(world_size: usize) -> Self {
        Self { world_size: world_size.max(1) }
    }

    /// `world_size == 1` bypasses all-reduce and the row/column split
    /// entirely (§8 boundary behavior).
    pub fn is_trivial(&self) -> bool {
        self.world_size <= 1
    }
}
