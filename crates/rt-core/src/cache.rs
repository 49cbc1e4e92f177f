//! Per-request, per-layer KV cache (§4.2). A pre-sized arena allocator is a
//! plausible future optimization but isn't needed for correctness here.

use rt_common::{RequestId, Result, RuntimeError};
use rt_kernels::{AttnSpan, Tensor};
use std::collections::HashMap;
use std::time::Instant;

/// One request's accumulated key/value history at a single layer.
#[derive(Debug, Clone)]
pub struct KVCacheEntry {
    pub key: Tensor,
    pub value: Tensor,
}

impl KVCacheEntry {
    pub fn len(&self) -> usize {
        self.key.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keyed by `(request_id, layer_idx, tp_rank)` — each request's K/V history
/// is independent per layer in a pipeline-parallel deployment (a client
/// only ever calls `update` for the layers it owns), and independent per
/// tensor-parallel rank too, since each rank caches only its own shard of
/// the K/V heads.
#[derive(Debug, Default)]
pub struct RequestsCache {
    cache: HashMap<(RequestId, usize, usize), KVCacheEntry>,
}

impl RequestsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_seq_len(&self, request_id: &str, layer_idx: usize, rank: usize) -> usize {
        self.cache
            .get(&(request_id.to_string(), layer_idx, rank))
            .map(|e| e.len())
            .unwrap_or(0)
    }

    pub fn get(&self, request_id: &str, layer_idx: usize, rank: usize) -> Option<&KVCacheEntry> {
        self.cache.get(&(request_id.to_string(), layer_idx, rank))
    }

    pub fn delete(&mut self, request_id: &str) {
        self.cache.retain(|(rid, _, _), _| rid != request_id);
    }

    /// Splits packed `key`/`value` activations by `request_ids`/
    /// `segment_lengths` (in that order), appends each request's new slice
    /// onto its existing history at `(layer_idx, rank)`, and returns the
    /// concatenated full K/V per request — in the same request order the
    /// batch came in — along with the `AttnSpan` (new length, total length)
    /// each request now has. This is the packed-batch update/concatenation
    /// step `RequestsCache.update` performs in the original.
    ///
    /// `known` is parallel to `request_ids`: `false` means this worker has
    /// never touched the request before, so a fresh empty history is
    /// started for it (a request's legitimate first hop); `true` means the
    /// request is expected to already have an entry here from an earlier
    /// hop, and a missing entry means the request was forgotten or evicted
    /// out from under an in-flight step, surfaced as `UnknownRequest`
    /// instead of silently starting it over with empty history.
    pub fn update(
        &mut self,
        layer_idx: usize,
        rank: usize,
        request_ids: &[RequestId],
        segment_lengths: &[usize],
        known: &[bool],
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor, Vec<AttnSpan>)> {
        if request_ids.len() != segment_lengths.len() || request_ids.len() != known.len() {
            return Err(RuntimeError::ShapeError(
                "update: request_ids, segment_lengths, and known length mismatch".into(),
            ));
        }
        let mut full_keys = Vec::with_capacity(request_ids.len());
        let mut full_values = Vec::with_capacity(request_ids.len());
        let mut spans = Vec::with_capacity(request_ids.len());
        let mut offset = 0;
        for ((request_id, &seg_len), &is_known) in request_ids.iter().zip(segment_lengths).zip(known) {
            let new_key = key.row_slice(offset, seg_len)?;
            let new_value = value.row_slice(offset, seg_len)?;
            offset += seg_len;

            let cache_key = (request_id.clone(), layer_idx, rank);
            let entry = if is_known {
                self.cache
                    .get_mut(&cache_key)
                    .ok_or_else(|| RuntimeError::UnknownRequest(request_id.clone()))?
            } else {
                self.cache.entry(cache_key).or_insert_with(|| KVCacheEntry {
                    key: Tensor::zeros(&[0, new_key.row_width()]),
                    value: Tensor::zeros(&[0, new_value.row_width()]),
                })
            };
            let past_len = entry.len();
            entry.key = Tensor::cat_rows(&[&entry.key, &new_key])?;
            entry.value = Tensor::cat_rows(&[&entry.value, &new_value])?;

            full_keys.push(entry.key.clone());
            full_values.push(entry.value.clone());
            spans.push(AttnSpan { q_len: seg_len, kv_len: past_len + seg_len });
        }
        let key_refs: Vec<&Tensor> = full_keys.iter().collect();
        let value_refs: Vec<&Tensor> = full_values.iter().collect();
        Ok((Tensor::cat_rows(&key_refs)?, Tensor::cat_rows(&value_refs)?, spans))
    }
}

/// Tracks last-touched times across every layer's `RequestsCache` for a
/// single worker and evicts requests idle past `max_alive_time`, grounded
/// on `CacheManager.check_alive`.
#[derive(Debug)]
pub struct CacheManager {
    requests: RequestsCache,
    last_touched: HashMap<RequestId, Instant>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self { requests: RequestsCache::new(), last_touched: HashMap::new() }
    }

    pub fn requests(&self) -> &RequestsCache {
        &self.requests
    }

    pub fn requests_mut(&mut self) -> &mut RequestsCache {
        &mut self.requests
    }

    pub fn touch(&mut self, request_id: &RequestId) {
        self.last_touched.insert(request_id.clone(), Instant::now());
    }

    /// Whether this worker has completed a prior hop for `request_id`.
    /// `WorkerEngine::forward` uses this, captured before the current
    /// hop's own `touch`, to tell `RequestsCache::update` whether a missing
    /// cache entry is a legitimate first hop or a forgotten/evicted request.
    pub fn is_touched(&self, request_id: &RequestId) -> bool {
        self.last_touched.contains_key(request_id)
    }

    pub fn delete(&mut self, request_id: &RequestId) {
        self.requests.delete(request_id);
        self.last_touched.remove(request_id);
    }

    /// Evicts every request whose last touch is older than `max_alive`,
    /// returning the evicted ids.
    pub fn check_alive(&mut self, max_alive: std::time::Duration) -> Vec<RequestId> {
        let now = Instant::now();
        let stale: Vec<RequestId> = self
            .last_touched
            .iter()
            .filter(|(_, t)| now.duration_since(**t) > max_alive)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.delete(id);
        }
        stale
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_preserves_request_order_and_appends_history() {
        let mut cache = RequestsCache::new();
        let ids = vec!["a".to_string(), "b".to_string()];
        let key = Tensor::from_vec(&[3, 2], vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]).unwrap();
        let value = key.clone();
        let (full_k, _full_v, spans) =
            cache.update(0, 0, &ids, &[2, 1], &[false, false], &key, &value).unwrap();
        assert_eq!(spans[0], AttnSpan { q_len: 2, kv_len: 2 });
        assert_eq!(spans[1], AttnSpan { q_len: 1, kv_len: 1 });
        assert_eq!(full_k.rows(), 3);

        // second hop: "a" sends one more token, history should now be 3
        let key2 = Tensor::from_vec(&[1, 2], vec![4.0, 4.0]).unwrap();
        let (full_k2, _v2, spans2) =
            cache.update(0, 0, &["a".to_string()], &[1], &[true], &key2, &key2).unwrap();
        assert_eq!(spans2[0], AttnSpan { q_len: 1, kv_len: 3 });
        assert_eq!(full_k2.rows(), 3);
    }

    #[test]
    fn update_rejects_a_known_request_missing_from_the_cache() {
        let mut cache = RequestsCache::new();
        let key = Tensor::from_vec(&[1, 2], vec![1.0, 1.0]).unwrap();
        let err = cache.update(0, 0, &["ghost".to_string()], &[1], &[true], &key, &key).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownRequest(id) if id == "ghost"));
    }

    #[test]
    fn cache_manager_evicts_stale_requests() {
        let mut mgr = CacheManager::new();
        let id = "req-1".to_string();
        let key = Tensor::from_vec(&[1, 2], vec![1.0, 1.0]).unwrap();
        mgr.requests_mut().update(0, 0, &[id.clone()], &[1], &[false], &key, &key).unwrap();
        mgr.touch(&id);
        let evicted = mgr.check_alive(std::time::Duration::from_secs(0));
        assert_eq!(evicted, vec![id.clone()]);
        assert_eq!(mgr.requests().get_seq_len(&id, 0, 0), 0);
        assert!(!mgr.is_touched(&id));
    }
}
