//! # Shared Protocol Library
//!
//! This crate contains the data structures and wire codec shared by the game
//! server and its test clients. Both transports speak the same tagged message
//! envelope; the datagram transport additionally wraps every envelope in a
//! [`Packet`] carrying the sequencing and reliability metadata used by the
//! server's retransmission layer.
//!
//! ## Wire formats
//!
//! ### Stream transport (WebSocket)
//! One JSON envelope per text frame:
//!
//! ```json
//! { "type": "Chat", "data": { "player_id": "…", "message": "hi" } }
//! ```
//!
//! ### Datagram transport (UDP)
//! One JSON packet per datagram, wrapping the same envelope:
//!
//! ```json
//! { "sequence": 7, "timestamp": 1700000000000, "message": { … }, "reliable": true }
//! ```
//!
//! Player ids are canonical dashed UUID strings. Encoded datagrams must stay
//! within [`MAX_DATAGRAM_SIZE`]; senders drop oversized state snapshots
//! rather than fragment them.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum size of an encoded datagram in bytes.
///
/// Chosen to fit a single ethernet MTU. The receive buffer on the server uses
/// the same bound, so anything larger would be truncated in flight.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Starting and maximum health of a player.
pub const MAX_HEALTH: f32 = 100.0;

/// Points awarded for a `pickup` action.
pub const PICKUP_SCORE: u32 = 10;

/// Errors produced by the wire codec.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),
}

/// A player entity as seen by every participant.
///
/// This is both the in-memory roster entry on the server and the snapshot
/// shape carried inside [`GameMessage::GameState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Player {
    pub id: Uuid,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub health: f32,
    pub score: u32,
}

impl Player {
    /// Creates a player at the origin with full health and no score.
    pub fn new(id: Uuid, name: String) -> Self {
        Self {
            id,
            name,
            x: 0.0,
            y: 0.0,
            health: MAX_HEALTH,
            score: 0,
        }
    }

    /// Sets health, clamped to `[0, MAX_HEALTH]`.
    pub fn set_health(&mut self, health: f32) {
        self.health = health.clamp(0.0, MAX_HEALTH);
    }
}

/// Derives the default display name from a player id.
///
/// Uses the first 8 hex digits of the canonical dashed form, e.g.
/// `Player_11111111`.
pub fn default_name(id: &Uuid) -> String {
    format!("Player_{}", &id.to_string()[..8])
}

/// The tagged message envelope spoken on both transports.
///
/// Serialized as `{ "type": "<Tag>", "data": { … } }`. The variants cover
/// roster changes, movement, free-form actions, state snapshots, chat, error
/// reporting, and the datagram liveness/acknowledgement pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GameMessage {
    PlayerJoin {
        player_id: Uuid,
        name: String,
    },
    PlayerLeave {
        player_id: Uuid,
    },
    PlayerMove {
        player_id: Uuid,
        x: f32,
        y: f32,
    },
    /// A free-form action. Recognized values of `action` are `attack` and
    /// `pickup`; anything else is logged by the server and ignored.
    PlayerAction {
        player_id: Uuid,
        action: String,
        data: serde_json::Value,
    },
    /// Full roster snapshot. `timestamp` is seconds since the Unix epoch.
    GameState {
        players: Vec<Player>,
        timestamp: u64,
    },
    Chat {
        player_id: Uuid,
        message: String,
    },
    Error {
        message: String,
    },
    /// Liveness datagram. The first heartbeat from an unknown endpoint also
    /// registers the client.
    Heartbeat {
        player_id: Uuid,
        sequence: u32,
    },
    /// Acknowledges receipt of the reliable packet with this sequence.
    Ack {
        sequence: u32,
    },
}

impl GameMessage {
    /// Encodes one envelope as a stream frame (UTF-8 JSON, no wrapper).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Decodes a stream frame back into an envelope.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// The datagram wrapper around a [`GameMessage`].
///
/// `sequence` comes from the sender's per-peer counter; packets the server
/// originates without reliability tracking (acks, heartbeats, move gossip)
/// use sequence 0. `timestamp` is milliseconds since the Unix epoch at
/// construction time. Packets with `reliable` set are retransmitted until
/// the matching [`GameMessage::Ack`] arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub sequence: u32,
    pub timestamp: i64,
    pub message: GameMessage,
    pub reliable: bool,
}

impl Packet {
    pub fn new(sequence: u32, message: GameMessage, reliable: bool) -> Self {
        Self {
            sequence,
            timestamp: timestamp_millis(),
            message,
            reliable,
        }
    }

    /// Encodes the packet as one UTF-8 JSON datagram.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Decodes a received datagram.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current time in whole seconds since the Unix epoch.
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> Uuid {
        "11111111-1111-1111-1111-111111111111".parse().unwrap()
    }

    #[test]
    fn player_defaults() {
        let player = Player::new(test_id(), "Player_11111111".to_string());
        assert_eq!(player.x, 0.0);
        assert_eq!(player.y, 0.0);
        assert_eq!(player.health, MAX_HEALTH);
        assert_eq!(player.score, 0);
    }

    #[test]
    fn health_is_clamped() {
        let mut player = Player::new(test_id(), "p".to_string());
        player.set_health(250.0);
        assert_eq!(player.health, MAX_HEALTH);
        player.set_health(-10.0);
        assert_eq!(player.health, 0.0);
        player.set_health(42.5);
        assert_eq!(player.health, 42.5);
    }

    #[test]
    fn default_name_uses_first_eight_hex_digits() {
        assert_eq!(default_name(&test_id()), "Player_11111111");
    }

    #[test]
    fn envelope_wire_shape() {
        let msg = GameMessage::Heartbeat {
            player_id: test_id(),
            sequence: 7,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "Heartbeat");
        assert_eq!(value["data"]["sequence"], 7);
        assert_eq!(
            value["data"]["player_id"],
            "11111111-1111-1111-1111-111111111111"
        );
    }

    #[test]
    fn ack_wire_shape() {
        let msg = GameMessage::Ack { sequence: 5 };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "Ack");
        assert_eq!(value["data"]["sequence"], 5);
    }

    #[test]
    fn envelope_roundtrip() {
        let messages = vec![
            GameMessage::PlayerJoin {
                player_id: test_id(),
                name: "Player_11111111".to_string(),
            },
            GameMessage::PlayerLeave {
                player_id: test_id(),
            },
            GameMessage::PlayerMove {
                player_id: test_id(),
                x: 12.5,
                y: -3.0,
            },
            GameMessage::PlayerAction {
                player_id: test_id(),
                action: "pickup".to_string(),
                data: serde_json::json!({ "item": "coin" }),
            },
            GameMessage::Chat {
                player_id: test_id(),
                message: "hello".to_string(),
            },
            GameMessage::Error {
                message: "too large".to_string(),
            },
        ];

        for msg in messages {
            let encoded = msg.encode().unwrap();
            let decoded = GameMessage::decode(&encoded).unwrap();
            assert_eq!(encoded, decoded.encode().unwrap());
        }
    }

    #[test]
    fn packet_roundtrip() {
        let packet = Packet::new(
            42,
            GameMessage::Chat {
                player_id: test_id(),
                message: "hi".to_string(),
            },
            true,
        );

        let data = packet.encode().unwrap();
        let decoded = Packet::decode(&data).unwrap();

        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.timestamp, packet.timestamp);
        assert!(decoded.reliable);
        match decoded.message {
            GameMessage::Chat { player_id, message } => {
                assert_eq!(player_id, test_id());
                assert_eq!(message, "hi");
            }
            _ => panic!("wrong message variant after roundtrip"),
        }
    }

    #[test]
    fn game_state_snapshot_roundtrip() {
        let msg = GameMessage::GameState {
            players: vec![Player::new(test_id(), "Player_11111111".to_string())],
            timestamp: 1_700_000_000,
        };

        let decoded = GameMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            GameMessage::GameState { players, timestamp } => {
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].id, test_id());
                assert_eq!(timestamp, 1_700_000_000);
            }
            _ => panic!("wrong message variant after roundtrip"),
        }
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert!(Packet::decode(b"").is_err());
        assert!(Packet::decode(b"{\"sequence\": 1}").is_err());
        assert!(GameMessage::decode("{\"type\": \"NoSuchTag\", \"data\": {}}").is_err());
        assert!(GameMessage::decode("not json").is_err());
    }

    #[test]
    fn typical_packets_fit_in_one_datagram() {
        let packet = Packet::new(
            u32::MAX,
            GameMessage::PlayerMove {
                player_id: test_id(),
                x: 99999.0,
                y: -99999.0,
            },
            true,
        );
        assert!(packet.encode().unwrap().len() <= MAX_DATAGRAM_SIZE);
    }
}
