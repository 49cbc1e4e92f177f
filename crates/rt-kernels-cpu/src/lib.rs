//! Correct, non-optimized reference implementation of the [`Kernels`]
//! capability set, implemented directly against row-major `Vec<f32>` data
//! instead of reaching for an FFI engine or a GPU tensor library — the
//! worker's correctness reference backend, not a performance one.

use rt_common::{Result, RuntimeError};
use rt_kernels::{AttnSpan, Kernels, Tensor};

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuKernels;

impl CpuKernels {
    pub fn new() -> Self {
        Self
    }
}

impl Kernels for CpuKernels {
    fn matmul(&self, x: &Tensor, w_t: &Tensor) -> Result<Tensor> {
        let (n, k) = x.assert_2d()?;
        let (m, k2) = w_t.assert_2d()?;
        if k != k2 {
            return Err(RuntimeError::ShapeError(format!(
                "matmul inner dimension mismatch: x has {k}, w_t has {k2}"
            )));
        }
        let mut out = vec![0.0f32; n * m];
        for i in 0..n {
            let x_row = &x.data[i * k..(i + 1) * k];
            for j in 0..m {
                let w_row = &w_t.data[j * k..(j + 1) * k];
                let mut acc = 0.0f32;
                for c in 0..k {
                    acc += x_row[c] * w_row[c];
                }
                out[i * m + j] = acc;
            }
        }
        Tensor::from_vec(&[n, m], out)
    }

    fn rmsnorm(&self, x: &Tensor, weight: &[f32], eps: f32) -> Result<Tensor> {
        let (n, d) = x.assert_2d()?;
        if weight.len() != d {
            return Err(RuntimeError::ShapeError(format!(
                "rmsnorm weight width {} does not match row width {}",
                weight.len(),
                d
            )));
        }
        let mut out = vec![0.0f32; n * d];
        for i in 0..n {
            let row = &x.data[i * d..(i + 1) * d];
            let ms: f32 = row.iter().map(|v| v * v).sum::<f32>() / d as f32;
            let scale = 1.0 / (ms + eps).sqrt();
            for c in 0..d {
                out[i * d + c] = row[c] * scale * weight[c];
            }
        }
        Tensor::from_vec(&[n, d], out)
    }

    fn silu(&self, x: &Tensor) -> Tensor {
        let data = x.data.iter().map(|&v| v / (1.0 + (-v).exp())).collect();
        Tensor { shape: x.shape.clone(), data }
    }

    fn apply_rope(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, num_heads: usize) -> Result<Tensor> {
        let (n, width) = x.assert_2d()?;
        if width % num_heads != 0 {
            return Err(RuntimeError::ShapeError(format!(
                "rope width {width} not divisible by num_heads {num_heads}"
            )));
        }
        let head_dim = width / num_heads;
        let half = head_dim / 2;
        let (cn, cd) = cos.assert_2d()?;
        if cn != n || cd != head_dim {
            return Err(RuntimeError::ShapeError(format!(
                "rope cos/sin table shape {:?} does not match {} rows of head_dim {}",
                cos.shape, n, head_dim
            )));
        }
        if sin.shape != cos.shape {
            return Err(RuntimeError::ShapeError("rope cos/sin shape mismatch".into()));
        }
        let mut out = vec![0.0f32; n * width];
        for row in 0..n {
            let cos_row = &cos.data[row * head_dim..(row + 1) * head_dim];
            let sin_row = &sin.data[row * head_dim..(row + 1) * head_dim];
            for h in 0..num_heads {
                let base = row * width + h * head_dim;
                let head = &x.data[base..base + head_dim];
                for i in 0..head_dim {
                    let rotated = if i < half { -head[i + half] } else { head[i - half] };
                    out[base + i] = head[i] * cos_row[i] + rotated * sin_row[i];
                }
            }
        }
        Tensor::from_vec(&[n, width], out)
    }

    fn causal_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        spans: &[AttnSpan],
        num_heads: usize,
        head_dim: usize,
    ) -> Result<Tensor> {
        let width = num_heads * head_dim;
        let (q_rows, qw) = q.assert_2d()?;
        let (k_rows, kw) = k.assert_2d()?;
        if qw != width || kw != width || v.shape != k.shape {
            return Err(RuntimeError::ShapeError(
                "causal_attention: q/k/v width does not match num_heads * head_dim".into(),
            ));
        }
        let expect_q: usize = spans.iter().map(|s| s.q_len).sum();
        let expect_kv: usize = spans.iter().map(|s| s.kv_len).sum();
        if expect_q != q_rows || expect_kv != k_rows {
            return Err(RuntimeError::ShapeError(format!(
                "causal_attention span totals ({expect_q},{expect_kv}) do not match tensor rows ({q_rows},{k_rows})"
            )));
        }

        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut out = vec![0.0f32; q_rows * width];
        let mut q_off = 0;
        let mut kv_off = 0;
        for span in spans {
            let past_len = span.kv_len - span.q_len;
            for h in 0..num_heads {
                for qi in 0..span.q_len {
                    let q_row_idx = q_off + qi;
                    let q_base = q_row_idx * width + h * head_dim;
                    let q_head = &q.data[q_base..q_base + head_dim];

                    // Query at local position `qi` may attend keys up through
                    // `past_len + qi` inclusive; a span with q_len == 1 (pure
                    // decode) always covers the whole cached history and
                    // needs no mask at all.
                    let visible = if span.q_len == 1 { span.kv_len } else { past_len + qi + 1 };

                    let mut scores = Vec::with_capacity(visible);
                    let mut max_score = f32::NEG_INFINITY;
                    for ki in 0..visible {
                        let k_row_idx = kv_off + ki;
                        let k_base = k_row_idx * width + h * head_dim;
                        let k_head = &k.data[k_base..k_base + head_dim];
                        let mut dot = 0.0f32;
                        for d in 0..head_dim {
                            dot += q_head[d] * k_head[d];
                        }
                        dot *= scale;
                        if dot > max_score {
                            max_score = dot;
                        }
                        scores.push(dot);
                    }
                    let mut sum = 0.0f32;
                    for s in scores.iter_mut() {
                        *s = (*s - max_score).exp();
                        sum += *s;
                    }
                    let out_base = q_row_idx * width + h * head_dim;
                    for ki in 0..visible {
                        let weight = scores[ki] / sum;
                        let v_row_idx = kv_off + ki;
                        let v_base = v_row_idx * width + h * head_dim;
                        let v_head = &v.data[v_base..v_base + head_dim];
                        for d in 0..head_dim {
                            out[out_base + d] += weight * v_head[d];
                        }
                    }
                }
            }
            q_off += span.q_len;
            kv_off += span.kv_len;
        }
        Tensor::from_vec(&[q_rows, width], out)
    }

    fn all_reduce_sum(&self, shards: &[Tensor]) -> Result<Tensor> {
        let Some(first) = shards.first() else {
            return Err(RuntimeError::ShapeError("all_reduce_sum of empty shard list".into()));
        };
        let mut acc = first.data.clone();
        for shard in &shards[1..] {
            if shard.shape != first.shape {
                return Err(RuntimeError::ShapeError(format!(
                    "all_reduce_sum shape mismatch: {:?} vs {:?}",
                    shard.shape, first.shape
                )));
            }
            for (a, b) in acc.iter_mut().zip(&shard.data) {
                *a += b;
            }
        }
        Tensor::from_vec(&first.shape.clone(), acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_identity_weight_is_passthrough() {
        let k = CpuKernels::new();
        let x = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let identity_t = Tensor::from_vec(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let out = k.matmul(&x, &identity_t).unwrap();
        assert_eq!(out.data, x.data);
    }

    #[test]
    fn rmsnorm_unit_weight_normalizes_scale() {
        let k = CpuKernels::new();
        let x = Tensor::from_vec(&[1, 4], vec![2.0, 2.0, 2.0, 2.0]).unwrap();
        let out = k.rmsnorm(&x, &[1.0, 1.0, 1.0, 1.0], 1e-6).unwrap();
        for v in out.data {
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn silu_zero_is_zero() {
        let k = CpuKernels::new();
        let x = Tensor::from_vec(&[1, 1], vec![0.0]).unwrap();
        let out = k.silu(&x);
        assert_eq!(out.data, vec![0.0]);
    }

    #[test]
    fn decode_span_skips_masking_and_sums_to_one() {
        let k = CpuKernels::new();
        let head_dim = 2;
        let num_heads = 1;
        let q = Tensor::from_vec(&[1, head_dim], vec![1.0, 0.0]).unwrap();
        let kv = Tensor::from_vec(&[3, head_dim], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let spans = [AttnSpan { q_len: 1, kv_len: 3 }];
        let out = k.causal_attention(&q, &kv, &kv, &spans, num_heads, head_dim).unwrap();
        assert_eq!(out.shape, vec![1, head_dim]);
    }

    #[test]
    fn all_reduce_sum_requires_matching_shapes() {
        let k = CpuKernels::new();
        let a = Tensor::zeros(&[1, 2]);
        let b = Tensor::zeros(&[1, 3]);
        assert!(k.all_reduce_sum(&[a, b]).is_err());
    }
}
