// SPDX-License-Identifier: Apache-2.0
//! Mesh relay: optional peer-to-peer forwarding over the upper half of
//! engine-a. Ten peer instances at most, each assigned one outbound lane
//! (positions 33-48) and one inbound lane (positions 49-64) in registration
//! order. Best-effort only: no ordering or delivery guarantees beyond "one
//! push per relay tick per subscription."

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FabricError;
use crate::lang::LanguageId;
use crate::registry::NodeRegistry;
use crate::util::unix_time_now;

/// First outbound lane position on engine-a.
pub const OUTBOUND_START: u32 = 33;
/// Last outbound lane position on engine-a.
pub const OUTBOUND_END: u32 = 48;
/// First inbound lane position on engine-a.
pub const INBOUND_START: u32 = 49;
/// Last inbound lane position on engine-a.
pub const INBOUND_END: u32 = 64;
/// Maximum number of peers the relay will register.
pub const MAX_PEERS: usize = 10;
/// Timeout applied to every outbound mesh HTTP call.
pub const MESH_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
/// Output records forwarded per subscription per relay tick.
const RELAY_BATCH_SIZE: usize = 5;

fn engine_a_address(position: u32) -> String {
    format!("{}{}", LanguageId::Python.letter(), position)
}

/// One registered peer instance and its assigned lanes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLanes {
    pub peer_id: String,
    pub peer_url: String,
    pub outbound_address: String,
    pub inbound_address: String,
    pub registered_at: f64,
    pub last_heartbeat_ok: Option<bool>,
}

/// A `(local slot address) -> (peer id)` output forwarding rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub local_address: String,
    pub peer_id: String,
}

/// Peer-to-peer relay over engine-a's upper half.
pub struct MeshRelay {
    peers: Vec<PeerLanes>,
    subscriptions: Vec<Subscription>,
    /// Lane index handed to the next registered peer. Monotonically
    /// increasing, never reused: removing a peer frees its peer slot but not
    /// its lane numbers, so a later registration can't collide with a peer
    /// that's still registered.
    next_lane_index: usize,
}

impl Default for MeshRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshRelay {
    pub fn new() -> Self {
        Self { peers: Vec::new(), subscriptions: Vec::new(), next_lane_index: 0 }
    }

    fn next_free_lane_index(&self) -> Option<usize> {
        if self.next_lane_index >= MAX_PEERS {
            return None;
        }
        Some(self.next_lane_index)
    }

    /// Register a peer, assigning it the next outbound/inbound lane pair that
    /// has never been handed out before. Fails once ten peers have ever been
    /// registered, even if some were since removed.
    pub fn register_peer(&mut self, peer_id: &str, peer_url: &str) -> Result<PeerLanes, FabricError> {
        if self.peers.iter().any(|p| p.peer_id == peer_id) {
            return Err(FabricError::Conflict(format!("peer already registered: {peer_id}")));
        }
        let index = self
            .next_free_lane_index()
            .ok_or_else(|| FabricError::RowFull("mesh-relay-peers".to_string()))?;
        let lanes = PeerLanes {
            peer_id: peer_id.to_string(),
            peer_url: peer_url.to_string(),
            outbound_address: engine_a_address(OUTBOUND_START + index as u32),
            inbound_address: engine_a_address(INBOUND_START + index as u32),
            registered_at: unix_time_now(),
            last_heartbeat_ok: None,
        };
        self.peers.push(lanes.clone());
        self.next_lane_index += 1;
        Ok(lanes)
    }

    /// Remove a peer, clearing its lanes. Other peers keep their lane
    /// assignments (no renumbering).
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.peer_id != peer_id);
        self.subscriptions.retain(|s| s.peer_id != peer_id);
        self.peers.len() != before
    }

    /// Register a `(local_address -> peer_id)` output forwarding rule.
    pub fn subscribe(&mut self, local_address: &str, peer_id: &str) -> bool {
        if !self.peers.iter().any(|p| p.peer_id == peer_id) {
            return false;
        }
        let subscription = Subscription { local_address: local_address.to_string(), peer_id: peer_id.to_string() };
        if !self.subscriptions.contains(&subscription) {
            self.subscriptions.push(subscription);
        }
        true
    }

    pub fn peers(&self) -> &[PeerLanes] {
        &self.peers
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Ping every peer once; failures are absorbed, not propagated.
    pub async fn heartbeat_tick(&mut self, client: &reqwest::Client) {
        for peer in &mut self.peers {
            let ok = client
                .get(format!("{}/healthz", peer.peer_url.trim_end_matches('/')))
                .timeout(MESH_HTTP_TIMEOUT)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            peer.last_heartbeat_ok = Some(ok);
        }
    }

    /// Read every subscription's pending output against `registry` and build
    /// the batch of outbound pushes. Synchronous and lock-scoped on purpose:
    /// callers should drop the registry lock before awaiting [`Self::send_relay_batch`].
    pub fn collect_relay_batch(&self, registry: &NodeRegistry) -> Vec<(String, serde_json::Value)> {
        let mut batch = Vec::new();
        for subscription in &self.subscriptions {
            let Some(peer) = self.peers.iter().find(|p| p.peer_id == subscription.peer_id) else { continue };
            let Some(slot) = registry.get_slot_by_address(&subscription.local_address) else { continue };
            let Some(records) = registry.read_slot_output(&slot.slot_id, RELAY_BATCH_SIZE) else { continue };
            if records.is_empty() {
                continue;
            }
            let body = serde_json::json!({
                "target_address": peer.inbound_address,
                "data": records,
                "source": subscription.local_address,
            });
            batch.push((peer.peer_url.clone(), body));
        }
        batch
    }

    /// Post a previously collected relay batch. Best-effort: a failed push
    /// is dropped silently rather than retried or surfaced.
    pub async fn send_relay_batch(client: &reqwest::Client, batch: Vec<(String, serde_json::Value)>) {
        for (peer_url, body) in batch {
            let _ = client
                .post(format!("{}/mesh/inbound", peer_url.trim_end_matches('/')))
                .timeout(MESH_HTTP_TIMEOUT)
                .json(&body)
                .send()
                .await;
        }
    }

    /// Handle an inbound push from a peer: validate the target is in the
    /// inbound range, then queue it on the local slot's input buffer.
    pub fn handle_inbound_push(
        &self,
        registry: &mut NodeRegistry,
        target_address: &str,
        data: serde_json::Value,
        source: &str,
    ) -> Result<(), FabricError> {
        let (letter, position) = target_address
            .split_at_checked(1)
            .and_then(|(l, p)| p.parse::<u32>().ok().map(|pos| (l, pos)))
            .ok_or_else(|| FabricError::UnknownSlot(target_address.to_string()))?;
        if letter != "a" || !(INBOUND_START..=INBOUND_END).contains(&position) {
            return Err(FabricError::PermissionDenied("mesh-inbound", target_address.to_string()));
        }
        let slot = registry
            .get_slot_by_address(target_address)
            .ok_or_else(|| FabricError::UnknownSlot(target_address.to_string()))?;
        if !registry.push_to_slot(&slot.slot_id, data, Some(source)) {
            return Err(FabricError::PermissionDenied("push", target_address.to_string()));
        }
        Ok(())
    }

    /// Snapshot for status reporting.
    pub fn summary(&self) -> MeshSummary {
        MeshSummary { peer_count: self.peers.len() as u32, subscription_count: self.subscriptions.len() as u32 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSummary {
    pub peer_count: u32,
    pub subscription_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_peer_assigns_lanes_in_order() {
        let mut mesh = MeshRelay::new();
        let p1 = mesh.register_peer("peer-1", "http://peer1.local").unwrap();
        let p2 = mesh.register_peer("peer-2", "http://peer2.local").unwrap();
        assert_eq!(p1.outbound_address, "a33");
        assert_eq!(p1.inbound_address, "a49");
        assert_eq!(p2.outbound_address, "a34");
        assert_eq!(p2.inbound_address, "a50");
    }

    #[test]
    fn removing_a_peer_does_not_renumber_others() {
        let mut mesh = MeshRelay::new();
        mesh.register_peer("peer-1", "http://peer1.local").unwrap();
        let p2 = mesh.register_peer("peer-2", "http://peer2.local").unwrap();
        assert!(mesh.remove_peer("peer-1"));
        assert_eq!(mesh.peers()[0].peer_id, "peer-2");
        assert_eq!(mesh.peers()[0].inbound_address, p2.inbound_address);
    }

    #[test]
    fn removing_then_registering_does_not_collide_with_a_survivor() {
        let mut mesh = MeshRelay::new();
        mesh.register_peer("peer-1", "http://peer1.local").unwrap();
        mesh.register_peer("peer-2", "http://peer2.local").unwrap();
        let p3 = mesh.register_peer("peer-3", "http://peer3.local").unwrap();
        assert!(mesh.remove_peer("peer-2"));
        let p4 = mesh.register_peer("peer-4", "http://peer4.local").unwrap();
        assert_ne!(p4.outbound_address, p3.outbound_address);
        assert_ne!(p4.inbound_address, p3.inbound_address);
    }

    #[test]
    fn tenth_peer_registration_exceeds_capacity() {
        let mut mesh = MeshRelay::new();
        for i in 0..MAX_PEERS {
            mesh.register_peer(&format!("peer-{i}"), "http://x").unwrap();
        }
        assert!(mesh.register_peer("overflow", "http://x").is_err());
    }

    #[test]
    fn inbound_push_rejects_addresses_outside_inbound_range() {
        let mut registry = NodeRegistry::new();
        let mesh = MeshRelay::new();
        let result = mesh.handle_inbound_push(&mut registry, "a10", serde_json::json!({}), "peer-1");
        assert!(result.is_err());
    }

    #[test]
    fn inbound_push_accepted_in_range_queues_input() {
        let mut registry = NodeRegistry::new();
        let mesh = MeshRelay::new();
        mesh.handle_inbound_push(&mut registry, "a49", serde_json::json!({"x": 1}), "peer-1").unwrap();
        let slot = registry.get_slot_by_address("a49").unwrap();
        let drained = registry.drain_input_buffer(&slot.slot_id);
        assert_eq!(drained.len(), 1);
    }
}
