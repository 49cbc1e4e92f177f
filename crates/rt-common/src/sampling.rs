//! Per-request sampling parameters (§3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub max_new_tokens: usize,
    pub n: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            max_new_tokens: 128,
            n: 1,
        }
    }
}

impl SamplingParams {
    /// Greedy (argmax) decoding: `temperature == 0`, per the end-to-end
    /// scenario fixtures in spec §8.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}
