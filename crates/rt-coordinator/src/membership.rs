//! Cluster membership and dynamic layer assignment (§4.8):
//! `register_client`, layer-range splitting, `find_continuous_path`,
//! `unregister_client`.
//!
//! The layer-range table is a fixed set of `pipeline_stages` slots computed
//! once at construction via [`crate::split::split_model_layers`] and never
//! recomputed afterward. A first-time registration claims whichever slot is
//! still free; a re-registration supplies its previously assigned
//! `pp_rank`/`start_idx`/`end_idx` back and just occupies that slot again.
//! Neither path ever moves another client's range — only `get_free_slot`
//! picks where a *new* client lands.

use crate::split::split_model_layers;
use rt_common::RuntimeError;
use rt_core::{ClientDescriptor, LayerRange};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct Registration {
    pub client: ClientDescriptor,
}

pub struct MembershipService {
    total_layers: usize,
    /// Fixed per-slot layer ranges, sized `pipeline_stages` at construction
    /// and never recomputed.
    slots: Vec<LayerRange>,
    /// How many clients currently occupy each slot.
    slot_counts: Vec<usize>,
    clients: HashMap<String, ClientDescriptor>,
    client_slot: HashMap<String, usize>,
    last_seen: HashMap<String, Instant>,
}

impl MembershipService {
    /// `pipeline_stages` is the number of pipeline-parallel slots the
    /// cluster is expected to fill; it sizes the fixed slot table up front,
    /// the same way the original's slot table is sized once from the
    /// model's layer count at startup.
    pub fn new(total_layers: usize, pipeline_stages: usize) -> Self {
        let slots = split_model_layers(total_layers, pipeline_stages.max(1));
        let slot_counts = vec![0; slots.len()];
        Self {
            total_layers,
            slots,
            slot_counts,
            clients: HashMap::new(),
            client_slot: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    pub fn get(&self, client_id: &str) -> Option<&ClientDescriptor> {
        self.clients.get(client_id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientDescriptor> {
        self.clients.values()
    }

    /// True once every precomputed slot has at least one occupant, the
    /// point at which a further registration becomes a spare replica
    /// instead of extending coverage.
    pub fn has_full_model(&self) -> bool {
        !self.slot_counts.is_empty() && self.slot_counts.iter().all(|&c| c > 0)
    }

    /// The first still-unoccupied slot, or slot `0` as a deterministic
    /// fallback once every slot already has an occupant (a redundant
    /// replica; the original picks one at random here, but this runtime
    /// always prefers the lowest-ranked slot — see DESIGN.md Open Question 2).
    fn get_free_slot(&self) -> usize {
        self.slot_counts.iter().position(|&c| c == 0).unwrap_or(0)
    }

    async fn reachable(host: &str, port: u16) -> bool {
        let Ok(addr): Result<SocketAddr, _> = format!("{host}:{port}").parse() else {
            return false;
        };
        matches!(timeout(Duration::from_secs(2), TcpStream::connect(addr)).await, Ok(Ok(_)))
    }

    /// Registers `client_id`, probing TCP reachability first. `reconnect`
    /// is `None` on a first-time connection (a free slot is picked for the
    /// client) or `Some((pp_rank, start_idx, end_idx))` on a re-registration
    /// (the client is placed back at its previously assigned, already-fixed
    /// slot; every other client's range is left untouched).
    pub async fn register_client(
        &mut self,
        client_id: String,
        host: String,
        port: u16,
        reconnect: Option<(usize, usize, usize)>,
    ) -> Result<Registration, RuntimeError> {
        if !Self::reachable(&host, port).await {
            return Err(RuntimeError::Transport(format!("client {host}:{port} unreachable")));
        }
        self.last_seen.insert(client_id.clone(), Instant::now());

        let (slot, range) = match reconnect {
            Some((pp_rank, start_idx, end_idx)) => (pp_rank, LayerRange::new(start_idx, end_idx)),
            None => {
                let slot = self.get_free_slot();
                (slot, self.slots.get(slot).copied().unwrap_or(LayerRange::new(0, self.total_layers)))
            }
        };
        if let Some(count) = self.slot_counts.get_mut(slot) {
            *count += 1;
        }
        self.client_slot.insert(client_id.clone(), slot);

        let client = ClientDescriptor {
            client_id: client_id.clone(),
            host,
            port,
            layer_range: Some(range),
            has_full_model: range.len() == self.total_layers,
        };
        self.clients.insert(client_id, client.clone());
        Ok(Registration { client })
    }

    /// Removes a client, freeing its slot's occupant count. Every other
    /// client's range is fixed and never needs recomputing.
    pub fn unregister_client(&mut self, client_id: &str) -> Vec<ClientDescriptor> {
        self.last_seen.remove(client_id);
        let Some(removed) = self.clients.remove(client_id) else {
            return Vec::new();
        };
        if let Some(slot) = self.client_slot.remove(client_id) {
            if let Some(count) = self.slot_counts.get_mut(slot) {
                *count = count.saturating_sub(1);
            }
        }
        vec![removed]
    }

    /// The fixed pipeline-stage slot a client occupies.
    pub fn pp_rank_of(&self, client_id: &str) -> usize {
        self.client_slot.get(client_id).copied().unwrap_or(0)
    }

    /// Records a heartbeat ping from `client_id` (§4.8 heartbeat).
    pub fn touch(&mut self, client_id: &str) {
        if self.clients.contains_key(client_id) {
            self.last_seen.insert(client_id.to_string(), Instant::now());
        }
    }

    /// Removes every client whose last heartbeat is older than `grace`
    /// (§4.8: "the coordinator removes a client after a grace period and
    /// re-runs path selection"). Returns the clients removed.
    pub fn sweep_stale(&mut self, grace: Duration) -> Vec<ClientDescriptor> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > grace)
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = Vec::new();
        for id in stale {
            removed.extend(self.unregister_client(&id));
        }
        removed
    }

    /// An ordered, contiguous client list covering every layer once, or
    /// `NoCoveringPath` if the cluster can't currently serve a full
    /// forward pass. A lone full-model replica always qualifies.
    pub fn find_continuous_path(&self) -> Result<Vec<ClientDescriptor>, RuntimeError> {
        if let Some(full) = self.clients.values().find(|c| c.has_full_model) {
            return Ok(vec![full.clone()]);
        }
        let mut path = Vec::with_capacity(self.slots.len());
        for slot in 0..self.slots.len() {
            let occupant = self
                .clients
                .values()
                .find(|c| self.client_slot.get(&c.client_id) == Some(&slot));
            match occupant {
                Some(c) => path.push(c.clone()),
                None => return Err(RuntimeError::NoCoveringPath),
            }
        }
        let ranges: Vec<LayerRange> = path.iter().filter_map(|c| c.layer_range).collect();
        if !LayerRange::covers_contiguously(&ranges, self.total_layers) {
            return Err(RuntimeError::NoCoveringPath);
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(pipeline_stages: usize) -> MembershipService {
        MembershipService::new(8, pipeline_stages)
    }

    async fn bound_listener() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn single_client_covers_everything_and_finds_path() {
        let (addr, _h) = bound_listener().await;
        let mut svc = service(1);
        let reg = svc.register_client("w0".into(), addr.ip().to_string(), addr.port(), None).await.unwrap();
        assert_eq!(reg.client.layer_range, Some(LayerRange::new(0, 8)));
        let path = svc.find_continuous_path().unwrap();
        assert_eq!(path.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_client_is_rejected() {
        let mut svc = service(1);
        let err = svc.register_client("w0".into(), "127.0.0.1".into(), 1, None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn two_workers_fill_distinct_precomputed_slots_without_reassignment() {
        let (addr, _h) = bound_listener().await;
        let mut svc = service(2);
        let first = svc.register_client("w0".into(), addr.ip().to_string(), addr.port(), None).await.unwrap();
        assert_eq!(first.client.layer_range, Some(LayerRange::new(0, 4)));
        let second = svc.register_client("w1".into(), addr.ip().to_string(), addr.port(), None).await.unwrap();
        assert_eq!(second.client.layer_range, Some(LayerRange::new(4, 8)));
        // w0's range is untouched by w1 joining.
        let w0 = svc.get("w0").unwrap();
        assert_eq!(w0.layer_range, Some(LayerRange::new(0, 4)));
        let path = svc.find_continuous_path().unwrap();
        assert_eq!(path.len(), 2);
    }

    #[tokio::test]
    async fn reconnecting_client_keeps_its_fixed_slot() {
        let (addr, _h) = bound_listener().await;
        let mut svc = service(2);
        svc.register_client("w0".into(), addr.ip().to_string(), addr.port(), None).await.unwrap();
        svc.register_client("w1".into(), addr.ip().to_string(), addr.port(), None).await.unwrap();
        // w0 reconnects and hands back its previous fixed assignment.
        let reg = svc
            .register_client("w0".into(), addr.ip().to_string(), addr.port(), Some((0, 0, 4)))
            .await
            .unwrap();
        assert_eq!(reg.client.layer_range, Some(LayerRange::new(0, 4)));
        let w1 = svc.get("w1").unwrap();
        assert_eq!(w1.layer_range, Some(LayerRange::new(4, 8)));
    }

    #[tokio::test]
    async fn stale_heartbeat_sweep_evicts_and_unregisters() {
        let (addr, _h) = bound_listener().await;
        let mut svc = service(1);
        svc.register_client("w0".into(), addr.ip().to_string(), addr.port(), None).await.unwrap();
        svc.last_seen.insert("w0".into(), Instant::now() - Duration::from_secs(120));
        let removed = svc.sweep_stale(Duration::from_secs(60));
        assert_eq!(removed.len(), 1);
        assert!(svc.get("w0").is_none());
    }

    #[test]
    fn split_layers_is_correct_grounding() {
        let ranges = split_model_layers(8, 2);
        assert_eq!(ranges, vec![LayerRange::new(0, 4), LayerRange::new(4, 8)]);
    }
}
