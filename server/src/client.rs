//! Stream-side client connection state
//!
//! A [`Client`] pairs the player entity with the bounded outbound queue of
//! its WebSocket connection. The queue decouples broadcasters from slow
//! consumers: enqueueing never blocks, and a full queue is reported as an
//! error so the caller can disconnect the laggard instead of stalling
//! everyone else.

use shared::{GameMessage, Player, ProtocolError};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Why an enqueue failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The queue held [`OUTBOUND_QUEUE_SIZE`] undelivered messages.
    #[error("outbound queue full")]
    QueueFull,
    /// The writer task is gone and the queue is closed.
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// A connected stream client and the player it owns.
pub struct Client {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub player: Player,
    pub session_id: Option<i64>,
    sender: mpsc::Sender<Message>,
}

impl Client {
    pub fn new(
        id: Uuid,
        addr: SocketAddr,
        name: String,
        session_id: Option<i64>,
        sender: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id,
            addr,
            player: Player::new(id, name),
            session_id,
            sender,
        }
    }

    /// Enqueues one envelope for delivery as a text frame.
    pub fn send_message(&self, message: &GameMessage) -> Result<(), SendError> {
        let json = message.encode()?;
        self.send_frame(Message::Text(json))
    }

    /// Enqueues an already-encoded frame.
    pub fn send_frame(&self, frame: Message) -> Result<(), SendError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn update_position(&mut self, x: f32, y: f32) {
        self.player.x = x;
        self.player.y = y;
    }

    pub fn set_health(&mut self, health: f32) {
        self.player.set_health(health);
    }

    pub fn add_score(&mut self, points: u32) {
        self.player.score += points;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(capacity: usize) -> (Client, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = Uuid::new_v4();
        let client = Client::new(
            id,
            "127.0.0.1:9000".parse().unwrap(),
            shared::default_name(&id),
            None,
            tx,
        );
        (client, rx)
    }

    #[test]
    fn send_enqueues_text_frame() {
        let (client, mut rx) = test_client(4);
        let msg = GameMessage::PlayerLeave {
            player_id: client.id,
        };

        client.send_message(&msg).unwrap();

        match rx.try_recv().unwrap() {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "PlayerLeave");
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn full_queue_is_reported() {
        let (client, _rx) = test_client(1);
        let msg = GameMessage::PlayerLeave {
            player_id: client.id,
        };

        client.send_message(&msg).unwrap();
        match client.send_message(&msg) {
            Err(SendError::QueueFull) => {}
            other => panic!("expected QueueFull, got {other:?}"),
        }
    }

    #[test]
    fn closed_queue_is_reported() {
        let (client, rx) = test_client(1);
        drop(rx);

        let msg = GameMessage::PlayerLeave {
            player_id: client.id,
        };
        match client.send_message(&msg) {
            Err(SendError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn score_and_health_mutators() {
        let (mut client, _rx) = test_client(1);
        client.add_score(10);
        client.add_score(10);
        assert_eq!(client.player.score, 20);

        client.set_health(-5.0);
        assert_eq!(client.player.health, 0.0);
        client.update_position(3.0, -4.0);
        assert_eq!((client.player.x, client.player.y), (3.0, -4.0));
    }
}
