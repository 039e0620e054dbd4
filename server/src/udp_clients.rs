//! Datagram client bookkeeping
//!
//! This module holds the per-endpoint state of the UDP transport: the
//! [`UdpClient`] record with its outbound sequence counter and unacked
//! reliable packets, and the [`ClientTable`] that maps endpoints to clients
//! and player ids back to endpoints.
//!
//! Locking discipline: the table sits behind one reader/writer lock and each
//! client behind its own, nested inside the table lock. Always acquire the
//! table lock first; never reach back into the table while holding a client
//! lock.

use shared::{Packet, Player};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A client is evicted after this long without any inbound packet.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// A reliable packet is re-sent once its last transmission is older than
/// this.
pub const RETRANSMIT_AFTER: Duration = Duration::from_millis(100);

/// Upper bound on unacked reliable packets per client. A peer that stops
/// acking but keeps the connection alive would otherwise grow this map
/// without limit; exceeding the cap marks the client for eviction.
pub const MAX_PENDING_PACKETS: usize = 1024;

/// A reliable packet awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub packet: Packet,
    pub last_sent: Instant,
}

/// Per-endpoint connection state for the datagram transport.
#[derive(Debug)]
pub struct UdpClient {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub player: Player,
    pub last_seen: Instant,
    pub session_id: Option<i64>,
    /// Highest sequence the client reported in its heartbeats.
    pub last_client_sequence: u32,
    sequence: u32,
    pending_acks: HashMap<u32, PendingPacket>,
    overflowed: bool,
}

impl UdpClient {
    pub fn new(id: Uuid, addr: SocketAddr, name: String, session_id: Option<i64>) -> Self {
        Self {
            id,
            addr,
            player: Player::new(id, name),
            last_seen: Instant::now(),
            session_id,
            last_client_sequence: 0,
            sequence: 0,
            pending_acks: HashMap::new(),
            overflowed: false,
        }
    }

    /// Marks the client as alive right now.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_timed_out(&self) -> bool {
        self.last_seen.elapsed() > CLIENT_TIMEOUT
    }

    /// Allocates the next outbound sequence number for this client.
    pub fn next_sequence(&mut self) -> u32 {
        self.sequence += 1;
        self.sequence
    }

    pub fn record_client_sequence(&mut self, sequence: u32) {
        self.last_client_sequence = sequence;
    }

    /// Tracks a reliable packet until it is acked. Returns false when the
    /// pending map is at capacity; the packet is then not tracked and the
    /// client is flagged for eviction.
    pub fn add_pending(&mut self, packet: Packet) -> bool {
        if self.pending_acks.len() >= MAX_PENDING_PACKETS {
            self.overflowed = true;
            return false;
        }
        self.pending_acks.insert(
            packet.sequence,
            PendingPacket {
                packet,
                last_sent: Instant::now(),
            },
        );
        true
    }

    /// Drops the pending entry for an acked sequence. Returns whether an
    /// entry existed.
    pub fn clear_pending(&mut self, sequence: u32) -> bool {
        self.pending_acks.remove(&sequence).is_some()
    }

    /// Returns clones of every pending packet due for retransmission and
    /// refreshes their last-send instants.
    pub fn stale_packets(&mut self) -> Vec<Packet> {
        let now = Instant::now();
        let mut due = Vec::new();
        for pending in self.pending_acks.values_mut() {
            if now.duration_since(pending.last_sent) > RETRANSMIT_AFTER {
                pending.last_sent = now;
                due.push(pending.packet.clone());
            }
        }
        due
    }

    pub fn pending_len(&self) -> usize {
        self.pending_acks.len()
    }

    pub fn has_pending(&self, sequence: u32) -> bool {
        self.pending_acks.contains_key(&sequence)
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn update_position(&mut self, x: f32, y: f32) {
        self.player.x = x;
        self.player.y = y;
        self.touch();
    }

    pub fn set_health(&mut self, health: f32) {
        self.player.set_health(health);
    }

    pub fn add_score(&mut self, points: u32) {
        self.player.score += points;
    }
}

/// Result of an admission attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The endpoint is already registered; treat the packet as coming from
    /// the existing client.
    EndpointExists,
    /// The player id is already claimed by a different endpoint; the caller
    /// drops the packet.
    IdConflict,
}

/// Both indices of the datagram transport, mutated together under one lock.
#[derive(Debug, Default)]
pub struct ClientTable {
    by_addr: HashMap<SocketAddr, Arc<RwLock<UdpClient>>>,
    by_id: HashMap<Uuid, SocketAddr>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a client, keeping both indices consistent.
    pub fn insert(&mut self, client: UdpClient) -> InsertOutcome {
        if self.by_addr.contains_key(&client.addr) {
            return InsertOutcome::EndpointExists;
        }
        if let Some(existing) = self.by_id.get(&client.id) {
            if *existing != client.addr {
                return InsertOutcome::IdConflict;
            }
        }

        self.by_id.insert(client.id, client.addr);
        self.by_addr
            .insert(client.addr, Arc::new(RwLock::new(client)));
        InsertOutcome::Inserted
    }

    /// Removes a client from both indices.
    pub fn remove(&mut self, addr: &SocketAddr, id: &Uuid) -> Option<Arc<RwLock<UdpClient>>> {
        let removed = self.by_addr.remove(addr);
        if self.by_id.get(id) == Some(addr) {
            self.by_id.remove(id);
        }
        removed
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<RwLock<UdpClient>>> {
        self.by_addr.get(addr).cloned()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.by_addr.contains_key(addr)
    }

    pub fn addr_of(&self, id: &Uuid) -> Option<SocketAddr> {
        self.by_id.get(id).copied()
    }

    /// Snapshot of every (endpoint, client) pair for iteration outside the
    /// table lock.
    pub fn entries(&self) -> Vec<(SocketAddr, Arc<RwLock<UdpClient>>)> {
        self.by_addr
            .iter()
            .map(|(addr, client)| (*addr, Arc::clone(client)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::GameMessage;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:4001".parse().unwrap()
    }

    fn test_client(addr: SocketAddr) -> UdpClient {
        let id = Uuid::new_v4();
        UdpClient::new(id, addr, shared::default_name(&id), None)
    }

    fn test_packet(sequence: u32) -> Packet {
        Packet::new(
            sequence,
            GameMessage::Ack { sequence },
            true,
        )
    }

    #[test]
    fn client_starts_fresh() {
        let client = test_client(test_addr());
        assert_eq!(client.player.score, 0);
        assert_eq!(client.pending_len(), 0);
        assert!(!client.is_timed_out());
        assert!(!client.is_overflowed());
    }

    #[test]
    fn sequences_are_monotonic() {
        let mut client = test_client(test_addr());
        assert_eq!(client.next_sequence(), 1);
        assert_eq!(client.next_sequence(), 2);
        assert_eq!(client.next_sequence(), 3);
    }

    #[test]
    fn pending_lifecycle() {
        let mut client = test_client(test_addr());

        assert!(client.add_pending(test_packet(5)));
        assert!(client.has_pending(5));
        assert_eq!(client.pending_len(), 1);

        assert!(client.clear_pending(5));
        assert!(!client.has_pending(5));
        assert!(!client.clear_pending(5));
    }

    #[test]
    fn only_stale_packets_are_due() {
        let mut client = test_client(test_addr());
        client.add_pending(test_packet(1));
        client.add_pending(test_packet(2));

        // Fresh packets are not re-sent
        assert!(client.stale_packets().is_empty());

        // Backdate one past the retransmission threshold
        client
            .pending_acks
            .get_mut(&1)
            .unwrap()
            .last_sent -= RETRANSMIT_AFTER + Duration::from_millis(10);

        let due = client.stale_packets();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].sequence, 1);

        // The sweep refreshed the timestamp, so nothing is due again yet
        assert!(client.stale_packets().is_empty());
    }

    #[test]
    fn timeout_uses_last_seen() {
        let mut client = test_client(test_addr());
        assert!(!client.is_timed_out());

        client.last_seen = Instant::now() - CLIENT_TIMEOUT - Duration::from_secs(1);
        assert!(client.is_timed_out());

        client.touch();
        assert!(!client.is_timed_out());
    }

    #[test]
    fn pending_cap_flags_overflow() {
        let mut client = test_client(test_addr());
        for seq in 0..MAX_PENDING_PACKETS as u32 {
            assert!(client.add_pending(test_packet(seq)));
        }

        assert!(!client.add_pending(test_packet(u32::MAX)));
        assert!(client.is_overflowed());
        assert_eq!(client.pending_len(), MAX_PENDING_PACKETS);
    }

    #[test]
    fn position_update_refreshes_liveness() {
        let mut client = test_client(test_addr());
        client.last_seen = Instant::now() - CLIENT_TIMEOUT - Duration::from_secs(1);

        client.update_position(10.0, 20.0);
        assert_eq!((client.player.x, client.player.y), (10.0, 20.0));
        assert!(!client.is_timed_out());
    }

    #[test]
    fn table_insert_and_lookup() {
        let mut table = ClientTable::new();
        let client = test_client(test_addr());
        let id = client.id;

        assert_eq!(table.insert(client), InsertOutcome::Inserted);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&test_addr()));
        assert_eq!(table.addr_of(&id), Some(test_addr()));
    }

    #[test]
    fn duplicate_endpoint_is_reported() {
        let mut table = ClientTable::new();
        table.insert(test_client(test_addr()));

        let other = test_client(test_addr());
        assert_eq!(table.insert(other), InsertOutcome::EndpointExists);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_id_from_other_endpoint_is_rejected() {
        let mut table = ClientTable::new();
        let client = test_client(test_addr());
        let id = client.id;
        table.insert(client);

        let imposter = UdpClient::new(id, test_addr2(), "Imposter".to_string(), None);
        assert_eq!(table.insert(imposter), InsertOutcome::IdConflict);

        // Reverse index still points at the original endpoint
        assert_eq!(table.addr_of(&id), Some(test_addr()));
        assert!(!table.contains(&test_addr2()));
    }

    #[test]
    fn remove_clears_both_indices() {
        let mut table = ClientTable::new();
        let client = test_client(test_addr());
        let id = client.id;
        table.insert(client);

        assert!(table.remove(&test_addr(), &id).is_some());
        assert!(table.is_empty());
        assert_eq!(table.addr_of(&id), None);
        assert!(table.remove(&test_addr(), &id).is_none());
    }

    #[test]
    fn entries_snapshot_all_clients() {
        let mut table = ClientTable::new();
        table.insert(test_client(test_addr()));
        table.insert(test_client(test_addr2()));

        let entries = table.entries();
        assert_eq!(entries.len(), 2);
        let addrs: Vec<SocketAddr> = entries.iter().map(|(addr, _)| *addr).collect();
        assert!(addrs.contains(&test_addr()));
        assert!(addrs.contains(&test_addr2()));
    }
}
