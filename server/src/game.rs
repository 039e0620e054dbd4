//! Shared game state for the stream transport
//!
//! Owns the authoritative roster of connected players, dispatches decoded
//! envelopes, and fans outbound messages through the per-connection bounded
//! queues. The roster lock is held only long enough to snapshot or mutate;
//! actual delivery never blocks on a peer because enqueueing is `try_send`.
//! A client whose queue has filled is evicted instead of stalling the
//! broadcast.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use shared::{GameMessage, Player, PICKUP_SCORE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::client::Client;
use crate::database::Database;
use crate::transport::Transport;

/// Cadence of the server tick loop (~60 Hz).
pub const TICK_INTERVAL: Duration = Duration::from_millis(16);

/// The roster and its persistence side channel.
pub struct GameState {
    clients: RwLock<HashMap<Uuid, Client>>,
    database: Database,
}

impl GameState {
    /// Creates the state and spawns its tick loop.
    pub fn new(database: Database) -> Arc<Self> {
        let state = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            database,
        });

        let tick_state = Arc::clone(&state);
        tokio::spawn(async move {
            tick_state.tick_loop().await;
        });

        state
    }

    /// Registers a freshly connected client.
    ///
    /// Persists the player, records the join, then delivers `PlayerJoin` to
    /// the newcomer, announces it to everyone else, and finally hands the
    /// newcomer a full roster snapshot.
    pub async fn add_client(&self, client: Client) {
        let client_id = client.id;
        let name = client.player.name.clone();
        let session_id = client.session_id;

        if let Err(e) = self.database.upsert_player(&client.player).await {
            error!("Failed to persist player {client_id}: {e}");
        }
        if let Err(e) = self
            .database
            .log_event(&client_id, session_id, "join", None)
            .await
        {
            error!("Failed to log join event for {client_id}: {e}");
        }

        self.clients.write().await.insert(client_id, client);

        let join = GameMessage::PlayerJoin {
            player_id: client_id,
            name,
        };
        self.send(client_id, &join).await;
        self.broadcast(&join, Some(client_id)).await;
        self.send_game_state(client_id).await;

        info!("Player {client_id} joined the game");
    }

    /// Removes a client from the roster and announces the departure.
    ///
    /// Dropping the removed [`Client`] closes its outbound queue, which
    /// unwinds the connection's writer task; the listener tears the reader
    /// half down with it and ends the persistent session.
    pub async fn remove_client(&self, client_id: Uuid) {
        let Some(client) = self.clients.write().await.remove(&client_id) else {
            return;
        };

        if let Err(e) = self
            .database
            .log_event(&client_id, client.session_id, "leave", None)
            .await
        {
            error!("Failed to log leave event for {client_id}: {e}");
        }
        drop(client);

        self.broadcast(
            &GameMessage::PlayerLeave {
                player_id: client_id,
            },
            None,
        )
        .await;

        info!("Player {client_id} left the game");
    }

    /// Dispatches one decoded envelope from the connection owning
    /// `client_id`.
    ///
    /// The envelope's inner player id must match the connection owner;
    /// mismatches are dropped with a log line and no reply.
    pub async fn handle_message(
        &self,
        client_id: Uuid,
        message: GameMessage,
        session_id: Option<i64>,
    ) {
        match message {
            GameMessage::PlayerMove { player_id, x, y } => {
                if player_id != client_id {
                    warn!("Dropping PlayerMove for {player_id} from connection {client_id}");
                    return;
                }

                {
                    let mut clients = self.clients.write().await;
                    match clients.get_mut(&client_id) {
                        Some(client) => client.update_position(x, y),
                        None => return,
                    }
                }

                if let Err(e) = self.database.update_position(&client_id, x, y).await {
                    error!("Failed to persist position for {client_id}: {e}");
                }
                let move_msg = GameMessage::PlayerMove { player_id, x, y };
                if let Err(e) = self
                    .database
                    .log_event(&client_id, session_id, "move", Some(&move_msg))
                    .await
                {
                    error!("Failed to log move event for {client_id}: {e}");
                }

                self.broadcast(&move_msg, Some(client_id)).await;
                self.broadcast_game_state().await;
            }

            GameMessage::PlayerAction {
                player_id, action, ..
            } => {
                if player_id != client_id {
                    warn!("Dropping PlayerAction for {player_id} from connection {client_id}");
                    return;
                }
                self.handle_player_action(client_id, &action, session_id)
                    .await;
            }

            GameMessage::Chat { player_id, message } => {
                if player_id != client_id {
                    warn!("Dropping Chat for {player_id} from connection {client_id}");
                    return;
                }

                if let Err(e) = self.database.save_chat(&client_id, session_id, &message).await {
                    error!("Failed to save chat from {client_id}: {e}");
                }
                let chat = GameMessage::Chat { player_id, message };
                if let Err(e) = self
                    .database
                    .log_event(&client_id, session_id, "chat", Some(&chat))
                    .await
                {
                    error!("Failed to log chat event for {client_id}: {e}");
                }

                // Chat goes to everyone, the sender included.
                self.broadcast(&chat, None).await;
            }

            other => {
                debug!("Ignoring {other:?} from connection {client_id}");
            }
        }
    }

    async fn handle_player_action(
        &self,
        client_id: Uuid,
        action: &str,
        session_id: Option<i64>,
    ) {
        match action {
            "attack" => {
                info!("Player {client_id} performed attack");
                if let Err(e) = self
                    .database
                    .log_event(&client_id, session_id, "attack", None)
                    .await
                {
                    error!("Failed to log attack event for {client_id}: {e}");
                }
            }
            "pickup" => {
                let new_score = {
                    let mut clients = self.clients.write().await;
                    match clients.get_mut(&client_id) {
                        Some(client) => {
                            client.add_score(PICKUP_SCORE);
                            client.player.score
                        }
                        None => return,
                    }
                };
                info!("Player {client_id} picked up item, score: {new_score}");

                if let Err(e) = self.database.update_score(&client_id, new_score).await {
                    error!("Failed to persist score for {client_id}: {e}");
                }
                if let Err(e) = self
                    .database
                    .log_event(&client_id, session_id, "pickup", None)
                    .await
                {
                    error!("Failed to log pickup event for {client_id}: {e}");
                }
            }
            other => {
                info!("Unknown action {other:?} from player {client_id}");
            }
        }
    }

    /// Current roster snapshot wrapped in a `GameState` envelope.
    async fn snapshot(&self) -> GameMessage {
        let players: Vec<Player> = self
            .clients
            .read()
            .await
            .values()
            .map(|client| client.player.clone())
            .collect();

        GameMessage::GameState {
            players,
            timestamp: shared::timestamp_secs(),
        }
    }

    async fn send_game_state(&self, client_id: Uuid) {
        let message = self.snapshot().await;
        self.send(client_id, &message).await;
    }

    async fn broadcast_game_state(&self) {
        let message = self.snapshot().await;
        if let GameMessage::GameState { players, .. } = &message {
            if players.is_empty() {
                return;
            }
        }
        self.broadcast(&message, None).await;
    }

    /// Enqueues a frame for every client, returning the ids whose queue was
    /// full or closed. The roster lock is only held for the iteration.
    async fn fan_out(&self, frame: &Message, exclude: Option<Uuid>) -> Vec<Uuid> {
        let clients = self.clients.read().await;
        let mut dead = Vec::new();
        for (id, client) in clients.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if let Err(e) = client.send_frame(frame.clone()) {
                warn!("Disconnecting client {id}: {e}");
                dead.push(*id);
            }
        }
        dead
    }

    /// Removes clients that could no longer be delivered to and announces
    /// their departure. Dropping each [`Client`] closes its queue, which the
    /// listener turns into a full connection teardown. The announcement
    /// itself is best-effort; anyone who overflows here is caught by the
    /// next broadcast.
    async fn evict(&self, dead: Vec<Uuid>) {
        for id in dead {
            let Some(client) = self.clients.write().await.remove(&id) else {
                continue;
            };
            if let Err(e) = self
                .database
                .log_event(&id, client.session_id, "leave", None)
                .await
            {
                error!("Failed to log leave event for {id}: {e}");
            }
            drop(client);

            let leave = GameMessage::PlayerLeave { player_id: id };
            match leave.encode() {
                Ok(json) => {
                    let _ = self.fan_out(&Message::Text(json), None).await;
                }
                Err(e) => error!("Failed to encode PlayerLeave: {e}"),
            }
            info!("Evicted unresponsive client {id}");
        }
    }

    async fn tick_loop(&self) {
        let mut ticker = interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Per-tick hook for server-authoritative updates.
    ///
    /// Nothing is emitted yet; clients drive all state changes. NPC movement
    /// and item spawning would go here.
    async fn tick(&self) {}

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Snapshot of a single roster entry.
    pub async fn player(&self, client_id: Uuid) -> Option<Player> {
        self.clients
            .read()
            .await
            .get(&client_id)
            .map(|client| client.player.clone())
    }
}

#[async_trait]
impl Transport for GameState {
    async fn send(&self, player_id: Uuid, message: &GameMessage) {
        let result = {
            let clients = self.clients.read().await;
            clients.get(&player_id).map(|c| c.send_message(message))
        };
        if let Some(Err(e)) = result {
            warn!("Failed to send to client {player_id}: {e}");
            self.evict(vec![player_id]).await;
        }
    }

    async fn broadcast(&self, message: &GameMessage, exclude: Option<Uuid>) {
        let frame = match message.encode() {
            Ok(json) => Message::Text(json),
            Err(e) => {
                error!("Failed to encode broadcast: {e}");
                return;
            }
        };

        let dead = self.fan_out(&frame, exclude).await;
        self.evict(dead).await;
    }
}
