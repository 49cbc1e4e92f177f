//! Elementwise tensor helpers too small to belong in the backend capability
//! set — residual addition is the same one-line loop on every backend.

use rt_common::{Result, RuntimeError};
use rt_kernels::Tensor;

pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.shape != b.shape {
        return Err(RuntimeError::ShapeError(format!(
            "residual add shape mismatch: {:?} vs {:?}",
            a.shape, b.shape
        )));
    }
    let data = a.data.iter().zip(&b.data).map(|(x, y)| x + y).collect();
    Ok(Tensor { shape: a.shape.clone(), data })
}

/// Expands grouped-query K/V heads to the query head count by repeating
/// each KV head `n_rep` times contiguously, matching the original's
/// `repeat_kv` (query head `q` reads KV head `q / n_rep`).
pub fn repeat_kv(t: &Tensor, num_kv_heads: usize, n_rep: usize, head_dim: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(t.clone());
    }
    let (rows, width) = t.assert_2d()?;
    if width != num_kv_heads * head_dim {
        return Err(RuntimeError::ShapeError(format!(
            "repeat_kv width {width} does not match num_kv_heads*head_dim {}",
            num_kv_heads * head_dim
        )));
    }
    let out_width = width * n_rep;
    let mut data = vec![0.0f32; rows * out_width];
    for r in 0..rows {
        for h in 0..num_kv_heads {
            let src = &t.data[r * width + h * head_dim..r * width + (h + 1) * head_dim];
            for rep in 0..n_rep {
                let dst_head = h * n_rep + rep;
                let dst_base = r * out_width + dst_head * head_dim;
                data[dst_base..dst_base + head_dim].copy_from_slice(src);
            }
        }
    }
    Tensor::from_vec(&[rows, out_width], data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_kv_is_identity_when_groups_equal_one() {
        let t = Tensor::from_vec(&[1, 2], vec![1.0, 2.0]).unwrap();
        let out = repeat_kv(&t, 1, 1, 2).unwrap();
        assert_eq!(out.data, t.data);
    }

    #[test]
    fn repeat_kv_duplicates_each_head_contiguously() {
        let t = Tensor::from_vec(&[1, 4], vec![1.0, 2.0, 10.0, 20.0]).unwrap();
        let out = repeat_kv(&t, 2, 2, 2).unwrap();
        assert_eq!(out.data, vec![1.0, 2.0, 1.0, 2.0, 10.0, 20.0, 10.0, 20.0]);
    }

    #[test]
    fn add_rejects_mismatched_shapes() {
        let a = Tensor::zeros(&[1, 2]);
        let b = Tensor::zeros(&[1, 3]);
        assert!(add(&a, &b).is_err());
    }
}
