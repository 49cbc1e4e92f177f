//! Tensor-parallel gated MLP sublayer (§4.4): fused gate/up column-parallel
//! projection, SiLU gate, row-parallel down projection with all-reduce.

use rt_common::Result;
use rt_kernels::{FusedParallelLinear, Kernels, RowParallelLinear, Tensor, TpGroup};

pub struct Mlp {
    gate_up: Vec<FusedParallelLinear>,
    down: Vec<RowParallelLinear>,
    group: TpGroup,
}

impl Mlp {
    pub fn shard(
        gate_proj_t: &Tensor,
        up_proj_t: &Tensor,
        down_proj_t: &Tensor,
        intermediate_size: usize,
        group: TpGroup,
    ) -> Result<Self> {
        let col_sizes = [intermediate_size, intermediate_size];
        let fused_weight = Tensor::cat_rows(&[gate_proj_t, up_proj_t])?;
        let mut gate_up = Vec::with_capacity(group.world_size);
        let mut down = Vec::with_capacity(group.world_size);
        for rank in 0..group.world_size {
            gate_up.push(FusedParallelLinear::shard(&fused_weight, &col_sizes, group, rank)?);
            down.push(RowParallelLinear::shard(down_proj_t, group, rank)?);
        }
        Ok(Self { gate_up, down, group })
    }

    pub fn forward(&self, hidden: &Tensor, kernels: &dyn Kernels) -> Result<Tensor> {
        let mut partials = Vec::with_capacity(self.group.world_size);
        for rank in 0..self.group.world_size {
            let fused = self.gate_up[rank].forward(hidden, kernels)?;
            let parts = self.gate_up[rank].split_output(&fused)?;
            let (gate, up) = (&parts[0], &parts[1]);
            let activated = kernels.silu(gate);
            let gated = elementwise_mul(&activated, up)?;
            partials.push(self.down[rank].forward_partial(&gated, kernels)?);
        }
        if partials.len() == 1 {
            Ok(partials.into_iter().next().unwrap())
        } else {
            kernels.all_reduce_sum(&partials)
        }
    }
}

fn elementwise_mul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    use rt_common::RuntimeError;
    if a.shape != b.shape {
        return Err(RuntimeError::ShapeError(format!(
            "mlp gate/up shape mismatch: {:?} vs {:?}",
            a.shape, b.shape
        )));
    }
    let data = a.data.iter().zip(&b.data).map(|(x, y)| x * y).collect();
    Ok(Tensor { shape: a.shape.clone(), data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_kernels_cpu::CpuKernels;

    #[test]
    fn world_size_one_skips_all_reduce() {
        let d = 4;
        let inter = 4;
        let w = Tensor::zeros(&[inter, d]);
        let down = Tensor::zeros(&[d, inter]);
        let mlp = Mlp::shard(&w, &w, &down, inter, TpGroup::new(1)).unwrap();
        let kernels = CpuKernels::new();
        let hidden = Tensor::zeros(&[2, d]);
        let out = mlp.forward(&hidden, &kernels).unwrap();
        assert_eq!(out.shape, vec![2, d]);
    }
}
