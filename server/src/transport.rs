//! Transport-independent outbound surface
//!
//! Both listeners ultimately do the same two things with an outbound
//! envelope: deliver it to one player, or fan it out to everyone except an
//! optional originator. This trait is that seam. The stream implementation
//! routes through per-connection bounded queues; the datagram implementation
//! picks a reliability class per message tag and goes through the
//! sequencing/retransmission machinery.
//!
//! Delivery is best-effort by contract: implementations log failures and
//! disconnect unreachable peers rather than surfacing errors to dispatchers.

use async_trait::async_trait;
use shared::GameMessage;
use uuid::Uuid;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers one envelope to a single connected player.
    async fn send(&self, player_id: Uuid, message: &GameMessage);

    /// Fans an envelope out to every connected player, excluding `exclude`
    /// when supplied.
    async fn broadcast(&self, message: &GameMessage, exclude: Option<Uuid>);
}
