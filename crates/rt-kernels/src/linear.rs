//! Sharded linear layers (§4.1): column-parallel (optionally fused, for
//! QKV/gate-up projections), and row-parallel with a trailing all-reduce.
//!
//! A column-parallel layer shards its weight by output row and needs no
//! synchronization: each rank produces a disjoint slice of the output
//! features. A row-parallel layer shards by input column; each rank's local
//! matmul yields a *partial sum* over the full output width, and the ranks
//! must all-reduce before the result is usable. `FusedParallelLinear`
//! extends the column-parallel case to several logically distinct
//! sub-projections (e.g. fused Q/K/V) stacked in one weight matrix.

use crate::kernels::{Kernels, TpGroup};
use crate::tensor::Tensor;
use rt_common::{Result, RuntimeError};

fn require_divisible(total: usize, world_size: usize, what: &str) -> Result<usize> {
    if total % world_size != 0 {
        return Err(RuntimeError::ShapeError(format!(
            "{what} of size {total} is not divisible by world_size {world_size}"
        )));
    }
    Ok(total / world_size)
}

/// Extracts columns `[start, start+len)` out of a row-major `[rows, cols]`
/// tensor into a new contiguous `[rows, len]` tensor.
fn column_slice(t: &Tensor, start: usize, len: usize) -> Result<Tensor> {
    let (rows, cols) = t.assert_2d()?;
    if start + len > cols {
        return Err(RuntimeError::ShapeError(format!(
            "column range [{},{}) out of bounds for width {}",
            start,
            start + len,
            cols
        )));
    }
    let mut data = Vec::with_capacity(rows * len);
    for r in 0..rows {
        let base = r * cols + start;
        data.extend_from_slice(&t.data[base..base + len]);
    }
    Tensor::from_vec(&[rows, len], data)
}

/// Shards by output row: rank `r` owns rows `[r * local_out, (r+1) *
/// local_out)` of the full `[out_features, in_features]` weight.
pub struct ColumnParallelLinear {
    local_weight: Tensor,
    pub local_out_features: usize,
    pub in_features: usize,
}

impl ColumnParallelLinear {
    pub fn shard(full_weight_t: &Tensor, group: TpGroup, rank: usize) -> Result<Self> {
        let (out_features, in_features) = full_weight_t.assert_2d()?;
        let local_out = require_divisible(out_features, group.world_size, "column-parallel out_features")?;
        let local_weight = full_weight_t.row_slice(rank * local_out, local_out)?;
        Ok(Self { local_weight, local_out_features: local_out, in_features })
    }

    /// Returns this rank's disjoint slice of the full output; no
    /// synchronization across ranks is needed.
    pub fn forward(&self, x: &Tensor, kernels: &dyn Kernels) -> Result<Tensor> {
        kernels.matmul(x, &self.local_weight)
    }
}

/// Shards by input column: rank `r` owns columns `[r * local_in, (r+1) *
/// local_in)` of the full `[out_features, in_features]` weight. Each rank's
/// local matmul is a partial sum over the full `out_features` width and
/// must be all-reduced across the group before use.
pub struct RowParallelLinear {
    local_weight: Tensor,
    pub out_features: usize,
    pub local_in_features: usize,
    group: TpGroup,
}

impl RowParallelLinear {
    pub fn shard(full_weight_t: &Tensor, group: TpGroup, rank: usize) -> Result<Self> {
        let (out_features, in_features) = full_weight_t.assert_2d()?;
        let local_in = require_divisible(in_features, group.world_size, "row-parallel in_features")?;
        let local_weight = column_slice(full_weight_t, rank * local_in, local_in)?;
        Ok(Self { local_weight, out_features, local_in_features: local_in, group })
    }

    /// Computes this rank's partial output. `x` must already be this rank's
    /// local shard of the input activations (width `local_in_features`).
    pub fn forward_partial(&self, x: &Tensor, kernels: &dyn Kernels) -> Result<Tensor> {
        kernels.matmul(x, &self.local_weight)
    }

    /// Runs `forward_partial` for every rank's shard of the *same* input
    /// columns and all-reduces the results. Used by the in-process engine,
    /// which co-locates every rank of a group in one worker (§9 Design
    /// Notes); a single-rank group skips the all-reduce call entirely.
    pub fn forward_all_ranks(
        shards: &[RowParallelLinear],
        x_shards: &[Tensor],
        kernels: &dyn Kernels,
    ) -> Result<Tensor> {
        if shards.len() != x_shards.len() {
            return Err(RuntimeError::ShapeError(
                "row-parallel rank count mismatch between weights and activations".into(),
            ));
        }
        let partials: Vec<Tensor> = shards
            .iter()
            .zip(x_shards)
            .map(|(s, x)| s.forward_partial(x, kernels))
            .collect::<Result<_>>()?;
        if partials.len() == 1 {
            return Ok(partials.into_iter().next().unwrap());
        }
        kernels.all_reduce_sum(&partials)
    }

    pub fn group(&self) -> TpGroup {
        self.group
    }
}

/// A column-parallel layer over several logically distinct sub-projections
/// stacked along the output dimension (fused Q/K/V, or fused gate+up).
/// Each sub-projection is sharded independently so a rank's local output
/// can be split back into its constituent parts without crossing
/// sub-projection boundaries.
pub struct FusedParallelLinear {
    local_weight: Tensor,
    pub in_features: usize,
    pub local_col_sizes: Vec<usize>,
}

impl FusedParallelLinear {
    pub fn shard(full_weight_t: &Tensor, col_sizes: &[usize], group: TpGroup, rank: usize) -> Result<Self> {
        let (out_features, in_features) = full_weight_t.assert_2d()?;
        let sum: usize = col_sizes.iter().sum();
        if sum != out_features {
            return Err(RuntimeError::ShapeError(format!(
                "fused col_sizes {col_sizes:?} sum to {sum}, expected {out_features}"
            )));
        }
        let mut local_col_sizes = Vec::with_capacity(col_sizes.len());
        let mut local_rows: Vec<Tensor> = Vec::with_capacity(col_sizes.len());
        let mut offset = 0;
        for &size in col_sizes {
            let local = require_divisible(size, group.world_size, "fused sub-projection size")?;
            local_col_sizes.push(local);
            local_rows.push(full_weight_t.row_slice(offset + rank * local, local)?);
            offset += size;
        }
        let refs: Vec<&Tensor> = local_rows.iter().collect();
        let local_weight = Tensor::cat_rows(&refs)?;
        Ok(Self { local_weight, in_features, local_col_sizes })
    }

    pub fn forward(&self, x: &Tensor, kernels: &dyn Kernels) -> Result<Tensor> {
        kernels.matmul(x, &self.local_weight)
    }

    /// Splits a forward output's columns back into the sub-projections in
    /// the order `col_sizes` was given, e.g. `(q, k, v)`.
    pub fn split_output(&self, out: &Tensor) -> Result<Vec<Tensor>> {
        let mut parts = Vec::with_capacity(self.local_col_sizes.len());
        let mut offset = 0;
        for &size in &self.local_col_sizes {
            parts.push(column_slice(out, offset, size)?);
            offset += size;
        }
        Ok(parts)
    }
}
