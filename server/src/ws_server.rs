//! Stream (WebSocket) listener
//!
//! Accepts TCP connections, upgrades them to WebSocket (origin checks are
//! permissive), and runs one reader and one writer task per connection so a
//! slow peer can never block inbound processing. Lifecycle bookkeeping
//! (session row, roster registration, teardown) brackets the read loop.

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use crate::client::{Client, OUTBOUND_QUEUE_SIZE};
use crate::database::Database;
use crate::game::GameState;
use shared::{default_name, GameMessage, Player};

/// Accept loop. Runs until the supervisor drops it.
pub async fn run(listener: TcpListener, game_state: Arc<GameState>, database: Database) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {addr}");
                let game_state = Arc::clone(&game_state);
                let database = database.clone();
                tokio::spawn(async move {
                    handle_connection(stream, addr, game_state, database).await;
                });
            }
            Err(e) => {
                error!("Accept error: {e}");
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    game_state: Arc<GameState>,
    database: Database,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake with {addr} failed: {e}");
            return;
        }
    };

    let client_id = Uuid::new_v4();
    let name = default_name(&client_id);

    // The session row references the player row, so the player goes in
    // first; registration refreshes it again right after.
    if let Err(e) = database
        .upsert_player(&Player::new(client_id, name.clone()))
        .await
    {
        error!("Failed to persist player {client_id}: {e}");
    }

    let session_id = match database
        .create_session(&client_id, "websocket", Some(&addr.ip().to_string()))
        .await
    {
        Ok(id) => Some(id),
        Err(e) => {
            error!("Failed to create session for {addr}: {e}");
            None
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);

    let client = Client::new(client_id, addr, name.clone(), session_id, tx);
    game_state.add_client(client).await;
    info!("Client {name} ({addr}) connected with session {session_id:?}");

    // Writer task: drains the bounded queue. It exits when the roster drops
    // the client (closing the queue) or the peer stops accepting writes.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let read_loop = async {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => match GameMessage::decode(&text) {
                    Ok(message) => {
                        game_state
                            .handle_message(client_id, message, session_id)
                            .await
                    }
                    Err(e) => warn!("Invalid frame from {addr}: {e}"),
                },
                Ok(Message::Close(_)) => {
                    info!("Client {addr} closed the connection");
                    break;
                }
                Ok(_) => {} // binary frames and pings are ignored
                Err(e) => {
                    warn!("WebSocket error from {addr}: {e}");
                    break;
                }
            }
        }
    };

    // The reader must not outlive the writer: an eviction (full outbound
    // queue) closes the queue, and the peer that caused it cannot be
    // trusted to close its side, so the connection is torn down here
    // either way.
    tokio::select! {
        _ = read_loop => {}
        _ = &mut writer => {
            info!("Outbound path for {addr} closed; terminating connection");
        }
    }

    game_state.remove_client(client_id).await;
    if let Some(session_id) = session_id {
        if let Err(e) = database.end_session(session_id).await {
            error!("Failed to end session {session_id}: {e}");
        }
    }
    writer.abort();
    info!("Client {name} ({addr}) disconnected");
}
