//! Persistence gateway tests against an in-memory database.
//!
//! Every test opens its own store, so they are independent and can run in
//! parallel.

use server::database::Database;
use shared::{GameMessage, Player};
use uuid::Uuid;

async fn test_db() -> Database {
    Database::new("sqlite::memory:").await.unwrap()
}

async fn seeded_player(db: &Database) -> Uuid {
    let id = Uuid::new_v4();
    let player = Player::new(id, shared::default_name(&id));
    db.upsert_player(&player).await.unwrap();
    id
}

#[tokio::test]
async fn upsert_and_partial_updates() {
    let db = test_db().await;
    let id = seeded_player(&db).await;

    db.update_position(&id, 100.0, 200.0).await.unwrap();
    db.update_score(&id, 250).await.unwrap();
    db.update_health(&id, 75.5).await.unwrap();

    let record = db.get_player(&id).await.unwrap().unwrap();
    assert_eq!(record.x, 100.0);
    assert_eq!(record.y, 200.0);
    assert_eq!(record.score, 250);
    assert_eq!(record.health, 75.5);
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let db = test_db().await;
    let id = Uuid::new_v4();
    let mut player = Player::new(id, "Repeat".to_string());
    player.x = 7.0;
    player.score = 30;

    db.upsert_player(&player).await.unwrap();
    db.upsert_player(&player).await.unwrap();

    assert_eq!(db.player_count().await.unwrap(), 1);
    let record = db.get_player(&id).await.unwrap().unwrap();
    assert_eq!(record.name, "Repeat");
    assert_eq!(record.x, 7.0);
    assert_eq!(record.score, 30);
}

#[tokio::test]
async fn missing_player_reads_as_none() {
    let db = test_db().await;
    assert!(db.get_player(&Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn session_lifecycle() {
    let db = test_db().await;
    let id = seeded_player(&db).await;

    let session_id = db
        .create_session(&id, "websocket", Some("127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(db.active_session_count().await.unwrap(), 1);

    // First end closes the row; the second finds nothing left to close.
    assert!(db.end_session(session_id).await.unwrap());
    assert!(!db.end_session(session_id).await.unwrap());
    assert_eq!(db.active_session_count().await.unwrap(), 0);
}

#[tokio::test]
async fn cleanup_closes_stale_sessions() {
    let db = test_db().await;
    let id = seeded_player(&db).await;

    db.create_session(&id, "udp", None).await.unwrap();
    db.create_session(&id, "udp", None).await.unwrap();
    assert_eq!(db.active_session_count().await.unwrap(), 2);

    // Threshold of zero hours makes every open session stale.
    assert_eq!(db.cleanup_old_sessions(0).await.unwrap(), 2);
    assert_eq!(db.active_session_count().await.unwrap(), 0);
    assert_eq!(db.cleanup_old_sessions(0).await.unwrap(), 0);
}

#[tokio::test]
async fn events_record_type_and_payload() {
    let db = test_db().await;
    let id = seeded_player(&db).await;
    let session_id = db.create_session(&id, "udp", None).await.unwrap();

    let move_msg = GameMessage::PlayerMove {
        player_id: id,
        x: 10.0,
        y: 20.0,
    };
    db.log_event(&id, Some(session_id), "join", None)
        .await
        .unwrap();
    db.log_event(&id, Some(session_id), "move", Some(&move_msg))
        .await
        .unwrap();
    db.log_event(&id, Some(session_id), "pickup", None)
        .await
        .unwrap();

    let events = db.player_events(&id, 10).await.unwrap();
    assert_eq!(events.len(), 3);

    let move_event = events
        .iter()
        .find(|event| event.event_type == "move")
        .unwrap();
    let payload = move_event.event_data.as_ref().unwrap();
    assert!(payload.contains("\"type\":\"PlayerMove\""));
    assert_eq!(move_event.session_id, Some(session_id));

    let join_event = events
        .iter()
        .find(|event| event.event_type == "join")
        .unwrap();
    assert!(join_event.event_data.is_none());
}

#[tokio::test]
async fn chat_messages_are_persisted() {
    let db = test_db().await;
    let id = seeded_player(&db).await;

    db.save_chat(&id, None, "Hello, world!").await.unwrap();
    db.save_chat(&id, None, "Second message").await.unwrap();

    let chats = db.recent_chats(10).await.unwrap();
    assert_eq!(chats.len(), 2);
    assert!(chats.iter().any(|chat| chat.message == "Hello, world!"));
    assert!(chats.iter().all(|chat| chat.player_id == id.to_string()));
}

#[tokio::test]
async fn high_scores_are_ordered() {
    let db = test_db().await;
    let first = seeded_player(&db).await;
    let second = seeded_player(&db).await;

    db.save_high_score(&first, 250, Some(300)).await.unwrap();
    db.save_high_score(&second, 500, Some(450)).await.unwrap();
    db.save_high_score(&first, 100, None).await.unwrap();

    let scores = db.high_scores(10).await.unwrap();
    assert_eq!(scores.len(), 3);
    assert_eq!(scores[0].score, 500);
    assert_eq!(scores[0].player_id, second.to_string());
    assert_eq!(scores[1].score, 250);
    assert_eq!(scores[2].score, 100);
    assert_eq!(scores[2].game_duration, None);
}

#[tokio::test]
async fn top_players_rank_by_score() {
    let db = test_db().await;
    let low = seeded_player(&db).await;
    let high = seeded_player(&db).await;

    db.update_score(&low, 10).await.unwrap();
    db.update_score(&high, 999).await.unwrap();

    let top = db.top_players(1).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].id, high.to_string());

    assert_eq!(db.player_count().await.unwrap(), 2);
}
