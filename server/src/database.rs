//! Persistence gateway
//!
//! A thin, cloneable handle over an embedded SQLite database. The realtime
//! path treats every call here as fire-and-forget: callers log failures and
//! keep serving packets, so a slow or broken disk degrades durability but
//! never gameplay.
//!
//! Writes are serialized through a single pooled connection, which keeps
//! concurrent callers safe without explicit locking on our side.

use chrono::{DateTime, Utc};
use log::{info, warn};
use shared::{GameMessage, Player};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Shared database handle. Cloning is cheap; all clones use the same pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// A persisted player row, the durable shadow of a live [`Player`].
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub id: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub health: f64,
    pub score: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PlayerEventRecord {
    pub id: i64,
    pub player_id: String,
    pub session_id: Option<i64>,
    pub event_type: String,
    pub event_data: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub id: i64,
    pub player_id: String,
    pub session_id: Option<i64>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HighScoreRecord {
    pub id: i64,
    pub player_id: String,
    pub score: i64,
    pub achieved_at: DateTime<Utc>,
    pub game_duration: Option<i64>,
}

impl Database {
    /// Opens (creating if necessary) the database at `database_url` and runs
    /// the embedded migrations.
    ///
    /// The `sqlite:` scheme prefix is accepted and stripped for filesystem
    /// checks; `:memory:` is reserved for tests and skips file creation.
    pub async fn new(database_url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        info!("Connecting to database: {database_url}");

        if database_url.starts_with("sqlite:") && !database_url.contains(":memory:") {
            let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            if !std::path::Path::new(path).exists() {
                tokio::fs::File::create(path).await?;
            }
        }

        // One connection: SQLite allows a single writer anyway, and this
        // makes an in-memory database visible to every caller.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("Database connection established and migrations completed");
        Ok(db)
    }

    async fn run_migrations(&self) -> sqlx::Result<()> {
        let migration_sql = include_str!("../migrations/001_initial.sql");

        for statement in migration_sql.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    /// Closes the pool, flushing any in-flight statement.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // --- Player operations ---

    /// Inserts the player or, when the id exists, refreshes every column
    /// along with `updated_at` and `last_seen_at`.
    pub async fn upsert_player(&self, player: &Player) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO players (id, name, x, y, health, score, updated_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, datetime('now'), datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                x = excluded.x,
                y = excluded.y,
                health = excluded.health,
                score = excluded.score,
                updated_at = datetime('now'),
                last_seen_at = datetime('now')
            "#,
        )
        .bind(player.id.to_string())
        .bind(&player.name)
        .bind(player.x as f64)
        .bind(player.y as f64)
        .bind(player.health as f64)
        .bind(player.score as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_position(&self, player_id: &Uuid, x: f32, y: f32) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE players
            SET x = ?, y = ?, updated_at = datetime('now'), last_seen_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(x as f64)
        .bind(y as f64)
        .bind(player_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_score(&self, player_id: &Uuid, score: u32) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE players
            SET score = ?, updated_at = datetime('now'), last_seen_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(score as i64)
        .bind(player_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_health(&self, player_id: &Uuid, health: f32) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE players
            SET health = ?, updated_at = datetime('now'), last_seen_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(health as f64)
        .bind(player_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_player(&self, player_id: &Uuid) -> sqlx::Result<Option<PlayerRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, x, y, health, score, created_at, updated_at, last_seen_at
            FROM players WHERE id = ?
            "#,
        )
        .bind(player_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(player_record))
    }

    /// Highest-scoring players, ties broken by recency.
    pub async fn top_players(&self, limit: i32) -> sqlx::Result<Vec<PlayerRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, x, y, health, score, created_at, updated_at, last_seen_at
            FROM players
            ORDER BY score DESC, updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(player_record).collect())
    }

    // --- Session operations ---

    /// Opens a session row for one connection interval and returns its id.
    pub async fn create_session(
        &self,
        player_id: &Uuid,
        protocol: &str,
        client_ip: Option<&str>,
    ) -> sqlx::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO game_sessions (player_id, protocol, client_ip) VALUES (?, ?, ?)",
        )
        .bind(player_id.to_string())
        .bind(protocol)
        .bind(client_ip)
        .execute(&self.pool)
        .await?;

        let session_id = result.last_insert_rowid();
        info!("Created {protocol} session {session_id} for player {player_id}");
        Ok(session_id)
    }

    /// Stamps the session end, but only on the first call: a session whose
    /// end is already set is left untouched. Returns whether this call
    /// closed it.
    pub async fn end_session(&self, session_id: i64) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE game_sessions
            SET session_end = datetime('now')
            WHERE id = ? AND session_end IS NULL
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        let closed = result.rows_affected() > 0;
        if closed {
            info!("Ended session {session_id}");
        }
        Ok(closed)
    }

    /// Closes every session with a null end older than `hours` hours and
    /// returns how many were affected.
    pub async fn cleanup_old_sessions(&self, hours: i32) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE game_sessions
            SET session_end = datetime('now')
            WHERE session_end IS NULL
              AND datetime(session_start, '+' || ? || ' hours') < datetime('now')
            "#,
        )
        .bind(hours)
        .execute(&self.pool)
        .await?;

        let affected = result.rows_affected();
        if affected > 0 {
            warn!("Cleaned up {affected} stale sessions (older than {hours} hours)");
        }
        Ok(affected)
    }

    // --- Event logging ---

    /// Appends one event row. When a message is supplied it is stored as its
    /// JSON encoding; a message that fails to encode is logged and stored as
    /// NULL rather than failing the event.
    pub async fn log_event(
        &self,
        player_id: &Uuid,
        session_id: Option<i64>,
        event_type: &str,
        event_data: Option<&GameMessage>,
    ) -> sqlx::Result<()> {
        let event_data_json = match event_data.map(serde_json::to_string) {
            Some(Ok(json)) => Some(json),
            Some(Err(e)) => {
                warn!("Failed to encode {event_type} event payload: {e}");
                None
            }
            None => None,
        };

        sqlx::query(
            "INSERT INTO player_events (player_id, session_id, event_type, event_data) VALUES (?, ?, ?, ?)",
        )
        .bind(player_id.to_string())
        .bind(session_id)
        .bind(event_type)
        .bind(event_data_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn player_events(
        &self,
        player_id: &Uuid,
        limit: i32,
    ) -> sqlx::Result<Vec<PlayerEventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, player_id, session_id, event_type, event_data, timestamp
            FROM player_events
            WHERE player_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(player_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PlayerEventRecord {
                id: row.get("id"),
                player_id: row.get("player_id"),
                session_id: row.get("session_id"),
                event_type: row.get("event_type"),
                event_data: row.get("event_data"),
                timestamp: row.get("timestamp"),
            })
            .collect())
    }

    // --- Chat ---

    pub async fn save_chat(
        &self,
        player_id: &Uuid,
        session_id: Option<i64>,
        message: &str,
    ) -> sqlx::Result<()> {
        sqlx::query("INSERT INTO chat_messages (player_id, session_id, message) VALUES (?, ?, ?)")
            .bind(player_id.to_string())
            .bind(session_id)
            .bind(message)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn recent_chats(&self, limit: i32) -> sqlx::Result<Vec<ChatRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, player_id, session_id, message, timestamp
            FROM chat_messages
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ChatRecord {
                id: row.get("id"),
                player_id: row.get("player_id"),
                session_id: row.get("session_id"),
                message: row.get("message"),
                timestamp: row.get("timestamp"),
            })
            .collect())
    }

    // --- High scores ---

    pub async fn save_high_score(
        &self,
        player_id: &Uuid,
        score: u32,
        duration_seconds: Option<u32>,
    ) -> sqlx::Result<()> {
        sqlx::query("INSERT INTO high_scores (player_id, score, game_duration) VALUES (?, ?, ?)")
            .bind(player_id.to_string())
            .bind(score as i64)
            .bind(duration_seconds.map(|d| d as i64))
            .execute(&self.pool)
            .await?;

        info!("Saved high score {score} for player {player_id}");
        Ok(())
    }

    pub async fn high_scores(&self, limit: i32) -> sqlx::Result<Vec<HighScoreRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT h.id, h.player_id, h.score, h.achieved_at, h.game_duration
            FROM high_scores h
            JOIN players p ON h.player_id = p.id
            ORDER BY h.score DESC, h.achieved_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HighScoreRecord {
                id: row.get("id"),
                player_id: row.get("player_id"),
                score: row.get("score"),
                achieved_at: row.get("achieved_at"),
                game_duration: row.get("game_duration"),
            })
            .collect())
    }

    // --- Statistics ---

    pub async fn player_count(&self) -> sqlx::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM players")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    pub async fn active_session_count(&self) -> sqlx::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM game_sessions WHERE session_end IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }
}

fn player_record(row: sqlx::sqlite::SqliteRow) -> PlayerRecord {
    PlayerRecord {
        id: row.get("id"),
        name: row.get("name"),
        x: row.get("x"),
        y: row.get("y"),
        health: row.get("health"),
        score: row.get("score"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_seen_at: row.get("last_seen_at"),
    }
}
