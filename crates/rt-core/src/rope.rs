//! Rotary position embedding table. Precomputes `cos`/`sin` for every
//! position up to `max_position_embeddings` once at construction; per-step
//! lookups just gather rows by position id, which is all a packed batch of
//! mixed prefill/decode requests needs.

use rt_kernels::Tensor;

pub struct RopeCache {
    head_dim: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RopeCache {
    pub fn new(head_dim: usize, theta: f32, max_position_embeddings: usize) -> Self {
        let half = head_dim / 2;
        let inv_freq: Vec<f32> =
            (0..half).map(|i| 1.0 / theta.powf((2 * i) as f32 / head_dim as f32)).collect();

        let mut cos = vec![0.0f32; max_position_embeddings * head_dim];
        let mut sin = vec![0.0f32; max_position_embeddings * head_dim];
        for pos in 0..max_position_embeddings {
            for (i, freq) in inv_freq.iter().enumerate() {
                let angle = pos as f32 * freq;
                let (s, c) = angle.sin_cos();
                // duplicated across both halves, matching the split-half
                // rotate_half convention `apply_rope` expects.
                cos[pos * head_dim + i] = c;
                cos[pos * head_dim + half + i] = c;
                sin[pos * head_dim + i] = s;
                sin[pos * head_dim + half + i] = s;
            }
        }
        Self { head_dim, cos, sin }
    }

    /// Gathers the `cos`/`sin` rows for `position_ids`, in order, as
    /// `[n, head_dim]` tensors ready for `Kernels::apply_rope`.
    pub fn gather(&self, position_ids: &[u32]) -> (Tensor, Tensor) {
        let mut cos_out = Vec::with_capacity(position_ids.len() * self.head_dim);
        let mut sin_out = Vec::with_capacity(position_ids.len() * self.head_dim);
        for &pos in position_ids {
            let base = pos as usize * self.head_dim;
            cos_out.extend_from_slice(&self.cos[base..base + self.head_dim]);
            sin_out.extend_from_slice(&self.sin[base..base + self.head_dim]);
        }
        let shape = [position_ids.len(), self.head_dim];
        (
            Tensor::from_vec(&shape, cos_out).expect("gather produces matching length"),
            Tensor::from_vec(&shape, sin_out).expect("gather produces matching length"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_zero_is_identity_rotation() {
        let cache = RopeCache::new(4, 10000.0, 8);
        let (cos, sin) = cache.gather(&[0]);
        assert!(cos.data.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(sin.data.iter().all(|&v| v.abs() < 1e-6));
    }
}
