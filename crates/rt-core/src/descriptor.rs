//! Static model shape and cluster membership descriptors (§3), replacing
//! the original's dynamic weight-key tree (`read_weight_from_model_path`'s
//! string-keyed state dict) with an explicit, typed model descriptor (§9
//! Design Notes).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    pub max_position_embeddings: usize,
    /// Token ids that terminate a sample with `FinishReason::Stop` (§4.7 step 5).
    pub eos_token_ids: Vec<u32>,
}

impl ModelDescriptor {
    pub fn kv_width(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    pub fn q_width(&self) -> usize {
        self.num_attention_heads * self.head_dim
    }

    pub fn n_rep(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads.max(1)
    }
}

/// A half-open range of decoder layer indices `[start, end)` one client
/// owns (§4.8). Layer 0 is always the first transformer block, never the
/// token embedding, which the coordinator owns directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: usize,
    pub end: usize,
}

impl LayerRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, layer_idx: usize) -> bool {
        layer_idx >= self.start && layer_idx < self.end
    }

    pub fn overlaps(&self, other: &LayerRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when `ranges`, sorted by `start`, exactly tile `[0, total_layers)`
    /// with no gap and no overlap (§4.8 `find_continuous_path` invariant).
    pub fn covers_contiguously(ranges: &[LayerRange], total_layers: usize) -> bool {
        let mut sorted = ranges.to_vec();
        sorted.sort_by_key(|r| r.start);
        let mut cursor = 0;
        for r in &sorted {
            if r.start != cursor {
                return false;
            }
            cursor = r.end;
        }
        cursor == total_layers
    }
}

/// A registered worker as the coordinator's membership table sees it (§4.8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub layer_range: Option<LayerRange>,
    /// True once this client has been assigned (or redundantly holds) every
    /// layer of the model, making it eligible to serve as a spare replica
    /// rather than extend coverage (§4.8).
    pub has_full_model: bool,
}

impl ClientDescriptor {
    pub fn forward_url(&self) -> String {
        format!("http://{}:{}/forward", self.host, self.port)
    }

    pub fn set_config_url(&self) -> String {
        format!("http://{}:{}/set_config", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_ranges_cover_total() {
        let ranges = [LayerRange::new(0, 4), LayerRange::new(4, 8)];
        assert!(LayerRange::covers_contiguously(&ranges, 8));
    }

    #[test]
    fn gap_breaks_contiguity() {
        let ranges = [LayerRange::new(0, 3), LayerRange::new(4, 8)];
        assert!(!LayerRange::covers_contiguously(&ranges, 8));
    }

    #[test]
    fn overlap_is_detected() {
        let a = LayerRange::new(0, 5);
        let b = LayerRange::new(4, 8);
        assert!(a.overlaps(&b));
    }
}
