//! Datagram (UDP) listener and reliability engine
//!
//! One socket, one receive loop, three background timers. Decoded packets
//! are dispatched on their own tasks so a slow persistence call never backs
//! up the socket. Reliability is at-least-once: every reliable outbound
//! packet is tracked per client and re-sent until the matching ack arrives
//! or the client is evicted. Nothing here guarantees ordering: sequence
//! numbers identify packets, they do not sequence delivery.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use shared::{default_name, GameMessage, Packet, Player, PICKUP_SCORE, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::interval;
use uuid::Uuid;

use crate::database::Database;
use crate::transport::Transport;
use crate::udp_clients::{ClientTable, InsertOutcome, UdpClient};

/// Cadence of server-originated liveness heartbeats.
pub const SERVER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of the timed-out-client sweep.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(10);

/// Cadence of the retransmission sweep.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(50);

/// The UDP game server: socket, client table, persistence side channel.
pub struct UdpGameServer {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientTable>>,
    database: Database,
}

enum HeartbeatKind {
    Known,
    New,
    /// Carried player id belongs to a different endpoint.
    Conflict,
}

impl UdpGameServer {
    pub async fn new(addr: &str, database: Database) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind(addr).await?;
        info!("UDP game server listening on {addr}");

        Ok(Self {
            socket: Arc::new(socket),
            clients: Arc::new(RwLock::new(ClientTable::new())),
            database,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Starts the background timers and runs the receive loop until the
    /// supervisor drops the future.
    pub async fn run(self: Arc<Self>) {
        self.spawn_heartbeat_task();
        self.spawn_eviction_task();
        self.spawn_retransmit_task();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((size, addr)) => match Packet::decode(&buf[..size]) {
                    Ok(packet) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_packet(addr, packet).await;
                        });
                    }
                    Err(e) => warn!("Discarding malformed datagram from {addr}: {e}"),
                },
                Err(e) => {
                    error!("UDP recv error: {e}");
                }
            }
        }
    }

    async fn handle_packet(&self, addr: SocketAddr, packet: Packet) {
        match packet.message {
            GameMessage::Heartbeat {
                player_id,
                sequence,
            } => self.handle_heartbeat(addr, player_id, sequence).await,
            GameMessage::Ack { sequence } => self.handle_ack(addr, sequence).await,
            GameMessage::PlayerMove { player_id, x, y } => {
                self.handle_move(addr, player_id, x, y, packet.sequence).await
            }
            GameMessage::PlayerAction {
                player_id, action, ..
            } => {
                self.handle_action(addr, player_id, &action, packet.sequence)
                    .await
            }
            GameMessage::Chat { player_id, message } => {
                self.handle_chat(addr, player_id, &message, packet.sequence)
                    .await
            }
            other => debug!("Ignoring {other:?} from {addr}"),
        }
    }

    /// Heartbeats are both liveness and admission: the first one from an
    /// unknown endpoint registers the client under the carried player id.
    async fn handle_heartbeat(&self, addr: SocketAddr, player_id: Uuid, sequence: u32) {
        let kind = {
            let table = self.clients.read().await;
            if let Some(client_ref) = table.get(&addr) {
                let mut client = client_ref.write().await;
                client.touch();
                client.record_client_sequence(sequence);
                HeartbeatKind::Known
            } else if table
                .addr_of(&player_id)
                .map_or(false, |existing| existing != addr)
            {
                HeartbeatKind::Conflict
            } else {
                HeartbeatKind::New
            }
        };

        match kind {
            HeartbeatKind::Conflict => {
                warn!("Dropping heartbeat from {addr}: player {player_id} is registered elsewhere");
                return;
            }
            HeartbeatKind::New => self.admit_client(addr, player_id).await,
            HeartbeatKind::Known => {}
        }

        self.send_ack(addr, sequence).await;
    }

    async fn admit_client(&self, addr: SocketAddr, player_id: Uuid) {
        let name = default_name(&player_id);

        // Player row first: the session row references it.
        if let Err(e) = self
            .database
            .upsert_player(&Player::new(player_id, name.clone()))
            .await
        {
            error!("Failed to persist UDP player {player_id}: {e}");
        }

        let session_id = match self
            .database
            .create_session(&player_id, "udp", Some(&addr.ip().to_string()))
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Failed to create UDP session for {addr}: {e}");
                None
            }
        };

        let client = UdpClient::new(player_id, addr, name.clone(), session_id);

        if let Err(e) = self
            .database
            .log_event(&player_id, session_id, "join", None)
            .await
        {
            error!("Failed to log UDP join event for {player_id}: {e}");
        }

        let outcome = self.clients.write().await.insert(client);
        match outcome {
            InsertOutcome::Inserted => {}
            InsertOutcome::EndpointExists => {
                // A concurrent heartbeat won the admission race; keep the
                // established client and retire the session we just opened.
                if let Some(session_id) = session_id {
                    let _ = self.database.end_session(session_id).await;
                }
                return;
            }
            InsertOutcome::IdConflict => {
                warn!("Admission race for player {player_id}: id claimed by another endpoint");
                if let Some(session_id) = session_id {
                    let _ = self.database.end_session(session_id).await;
                }
                return;
            }
        }

        info!("New UDP client connected: {name} ({addr}) with session {session_id:?}");

        let join = GameMessage::PlayerJoin { player_id, name };
        self.broadcast(&join, Some(player_id)).await;

        let snapshot = self.snapshot_message().await;
        self.send(player_id, &snapshot).await;
    }

    async fn handle_ack(&self, addr: SocketAddr, sequence: u32) {
        let client_ref = self.clients.read().await.get(&addr);
        if let Some(client_ref) = client_ref {
            if client_ref.write().await.clear_pending(sequence) {
                debug!("Ack {sequence} from {addr}");
            }
        }
    }

    async fn handle_move(&self, addr: SocketAddr, player_id: Uuid, x: f32, y: f32, sequence: u32) {
        let Some(client_ref) = self.clients.read().await.get(&addr) else {
            return;
        };

        let session_id = {
            let mut client = client_ref.write().await;
            if client.id != player_id {
                return;
            }
            client.update_position(x, y);
            client.session_id
        };

        if let Err(e) = self.database.update_position(&player_id, x, y).await {
            error!("Failed to persist position for {player_id}: {e}");
        }

        // Moves arrive at tick rate; persist every one but only journal
        // every tenth as an event.
        if sequence % 10 == 0 {
            let move_msg = GameMessage::PlayerMove { player_id, x, y };
            if let Err(e) = self
                .database
                .log_event(&player_id, session_id, "move", Some(&move_msg))
                .await
            {
                error!("Failed to log move event for {player_id}: {e}");
            }
        }

        self.send_ack(addr, sequence).await;

        let move_msg = GameMessage::PlayerMove { player_id, x, y };
        self.broadcast(&move_msg, Some(player_id)).await;
    }

    async fn handle_action(&self, addr: SocketAddr, player_id: Uuid, action: &str, sequence: u32) {
        let Some(client_ref) = self.clients.read().await.get(&addr) else {
            return;
        };

        let session_id = {
            let client = client_ref.read().await;
            if client.id != player_id {
                return;
            }
            client.session_id
        };

        match action {
            "attack" => {
                info!("Player {player_id} performed attack");
                if let Err(e) = self
                    .database
                    .log_event(&player_id, session_id, "attack", None)
                    .await
                {
                    error!("Failed to log attack event for {player_id}: {e}");
                }
            }
            "pickup" => {
                let new_score = {
                    let mut client = client_ref.write().await;
                    client.add_score(PICKUP_SCORE);
                    client.player.score
                };
                info!("Player {player_id} picked up item, score: {new_score}");

                if let Err(e) = self.database.update_score(&player_id, new_score).await {
                    error!("Failed to persist score for {player_id}: {e}");
                }
                if let Err(e) = self
                    .database
                    .log_event(&player_id, session_id, "pickup", None)
                    .await
                {
                    error!("Failed to log pickup event for {player_id}: {e}");
                }
            }
            other => {
                info!("Unknown action {other:?} from player {player_id}");
            }
        }

        self.send_ack(addr, sequence).await;
    }

    async fn handle_chat(&self, addr: SocketAddr, player_id: Uuid, message: &str, sequence: u32) {
        let Some(client_ref) = self.clients.read().await.get(&addr) else {
            return;
        };

        let session_id = {
            let client = client_ref.read().await;
            if client.id != player_id {
                return;
            }
            client.session_id
        };

        if let Err(e) = self.database.save_chat(&player_id, session_id, message).await {
            error!("Failed to save chat from {player_id}: {e}");
        }
        let chat = GameMessage::Chat {
            player_id,
            message: message.to_string(),
        };
        if let Err(e) = self
            .database
            .log_event(&player_id, session_id, "chat", Some(&chat))
            .await
        {
            error!("Failed to log chat event for {player_id}: {e}");
        }

        self.send_ack(addr, sequence).await;
        self.broadcast(&chat, Some(player_id)).await;
    }

    /// Server acks carry sequence 0 and are themselves unreliable.
    async fn send_ack(&self, addr: SocketAddr, sequence: u32) {
        let packet = Packet::new(0, GameMessage::Ack { sequence }, false);
        self.send_packet(&packet, addr).await;
    }

    async fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        let data = match packet.encode() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode packet for {addr}: {e}");
                return;
            }
        };
        if data.len() > MAX_DATAGRAM_SIZE {
            warn!("Dropping oversized packet ({} bytes) for {addr}", data.len());
            return;
        }
        self.send_bytes(&data, addr).await;
    }

    async fn send_bytes(&self, data: &[u8], addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(data, addr).await {
            error!("Failed to send to {addr}: {e}");
        }
    }

    /// Wraps `message` with a fresh sequence for this client, tracks it for
    /// retransmission, and sends it once. An encoding that exceeds the MTU
    /// is not sent; the peer gets an `Error` envelope instead of a fragment.
    async fn send_reliable_to(
        &self,
        client_ref: &Arc<RwLock<UdpClient>>,
        addr: SocketAddr,
        message: &GameMessage,
    ) {
        let data = {
            let mut client = client_ref.write().await;
            let sequence = client.next_sequence();
            let packet = Packet::new(sequence, message.clone(), true);

            let data = match packet.encode() {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to encode reliable packet for {addr}: {e}");
                    return;
                }
            };
            if data.len() > MAX_DATAGRAM_SIZE {
                drop(client);
                warn!(
                    "Dropping oversized reliable packet ({} bytes) for {addr}",
                    data.len()
                );
                let err = Packet::new(
                    0,
                    GameMessage::Error {
                        message: "game state snapshot too large".to_string(),
                    },
                    false,
                );
                self.send_packet(&err, addr).await;
                return;
            }

            if !client.add_pending(packet) {
                warn!("Pending window full for {addr}; client flagged for eviction");
            }
            data
        };

        self.send_bytes(&data, addr).await;
    }

    async fn broadcast_reliable(&self, message: &GameMessage, exclude: Option<SocketAddr>) {
        let entries = self.clients.read().await.entries();
        for (addr, client_ref) in entries {
            if exclude == Some(addr) {
                continue;
            }
            self.send_reliable_to(&client_ref, addr, message).await;
        }
    }

    async fn broadcast_unreliable(&self, message: &GameMessage, exclude: Option<SocketAddr>) {
        let packet = Packet::new(0, message.clone(), false);
        let entries = self.clients.read().await.entries();
        for (addr, _) in entries {
            if exclude == Some(addr) {
                continue;
            }
            self.send_packet(&packet, addr).await;
        }
    }

    /// Current roster snapshot wrapped in a `GameState` envelope.
    async fn snapshot_message(&self) -> GameMessage {
        let entries = self.clients.read().await.entries();
        let mut players = Vec::with_capacity(entries.len());
        for (_, client_ref) in &entries {
            players.push(client_ref.read().await.player.clone());
        }

        GameMessage::GameState {
            players,
            timestamp: shared::timestamp_secs(),
        }
    }

    fn spawn_heartbeat_task(self: &Arc<Self>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(SERVER_HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                server.send_server_heartbeats().await;
            }
        });
    }

    async fn send_server_heartbeats(&self) {
        let entries = self.clients.read().await.entries();
        for (addr, client_ref) in entries {
            let player_id = client_ref.read().await.id;
            let packet = Packet::new(
                0,
                GameMessage::Heartbeat {
                    player_id,
                    sequence: 0,
                },
                false,
            );
            self.send_packet(&packet, addr).await;
        }
    }

    fn spawn_eviction_task(self: &Arc<Self>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(EVICTION_INTERVAL);
            loop {
                ticker.tick().await;
                server.evict_stale_clients().await;
            }
        });
    }

    /// Removes clients that went silent or overran their pending window.
    /// Their session rows are closed later by the stale-session sweeper.
    async fn evict_stale_clients(&self) {
        let entries = self.clients.read().await.entries();
        let mut stale = Vec::new();
        for (addr, client_ref) in entries {
            let client = client_ref.read().await;
            if client.is_timed_out() || client.is_overflowed() {
                stale.push((addr, client.id));
            }
        }
        if stale.is_empty() {
            return;
        }

        let mut table = self.clients.write().await;
        for (addr, player_id) in stale {
            if table.remove(&addr, &player_id).is_some() {
                info!("Removed timed out UDP client {player_id} ({addr})");
            }
        }
    }

    fn spawn_retransmit_task(self: &Arc<Self>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(RETRANSMIT_INTERVAL);
            loop {
                ticker.tick().await;
                server.retransmit_pending().await;
            }
        });
    }

    async fn retransmit_pending(&self) {
        let entries = self.clients.read().await.entries();
        for (addr, client_ref) in entries {
            let due = client_ref.write().await.stale_packets();
            for packet in due {
                debug!("Retransmitting packet {} to {addr}", packet.sequence);
                self.send_packet(&packet, addr).await;
            }
        }
    }
}

/// Reliability class per message tag.
///
/// Roster changes, chat, and state snapshots must arrive; movement gossip
/// and heartbeats are refreshed constantly and may be lost.
fn reliable_class(message: &GameMessage) -> bool {
    matches!(
        message,
        GameMessage::PlayerJoin { .. }
            | GameMessage::PlayerLeave { .. }
            | GameMessage::Chat { .. }
            | GameMessage::GameState { .. }
    )
}

#[async_trait]
impl Transport for UdpGameServer {
    async fn send(&self, player_id: Uuid, message: &GameMessage) {
        let target = {
            let table = self.clients.read().await;
            table
                .addr_of(&player_id)
                .and_then(|addr| table.get(&addr).map(|client_ref| (addr, client_ref)))
        };
        let Some((addr, client_ref)) = target else {
            return;
        };

        if reliable_class(message) {
            self.send_reliable_to(&client_ref, addr, message).await;
        } else {
            let packet = Packet::new(0, message.clone(), false);
            self.send_packet(&packet, addr).await;
        }
    }

    async fn broadcast(&self, message: &GameMessage, exclude: Option<Uuid>) {
        let exclude_addr = match exclude {
            Some(player_id) => self.clients.read().await.addr_of(&player_id),
            None => None,
        };

        if reliable_class(message) {
            self.broadcast_reliable(message, exclude_addr).await;
        } else {
            self.broadcast_unreliable(message, exclude_addr).await;
        }
    }
}
