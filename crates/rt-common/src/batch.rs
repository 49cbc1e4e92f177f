//! Sequence batch input (§3): the ordered `(request_id, segment_length)`
//! list that accompanies a packed activation tensor at every hop of a step.

use crate::RequestId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpan {
    pub request_id: RequestId,
    pub segment_length: usize,
}

/// The ordered list accompanying one hop's activation tensor. The order and
/// multiplicities of `request_id`s must be identical at every hop of a step
/// (spec §3 invariant); this type makes that list a first-class, checkable
/// value instead of two parallel vectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqBatch(pub Vec<SegmentSpan>);

impl SeqBatch {
    pub fn total_len(&self) -> usize {
        self.0.iter().map(|s| s.segment_length).sum()
    }

    pub fn request_ids(&self) -> impl Iterator<Item = &RequestId> {
        self.0.iter().map(|s| &s.request_id)
    }

    pub fn segment_lengths(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().map(|s| s.segment_length)
    }

    /// True when every span belongs to an active decode step (length 1),
    /// the mask-free attention path of spec §8.
    pub fn is_pure_decode(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|s| s.segment_length == 1)
    }
}
