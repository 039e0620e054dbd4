//! Supervisor: configuration, persistence bootstrap, transport selection,
//! graceful shutdown.

use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use server::config::{Config, Protocol};
use server::database::Database;
use server::game::GameState;
use server::udp_server::UdpGameServer;
use server::ws_server;

/// Cadence of the stale-session sweep. The first sweep runs at boot, which
/// also closes sessions left open by a crash.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Sessions with no end timestamp older than this are closed by the sweep.
const STALE_SESSION_HOURS: i32 = 24;

/// How long in-flight handlers get to finish after the listener stops.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    init_logging(&config.log_level);

    info!(
        "Starting game server: {} on port {}",
        config.protocol.as_str(),
        config.port
    );

    let database = Database::new(&config.database_url).await?;
    info!("Database initialized: {}", config.database_url);

    spawn_session_sweeper(database.clone());

    let addr = config.bind_addr();
    match config.protocol {
        Protocol::Udp => {
            let udp_server = Arc::new(UdpGameServer::new(&addr, database.clone()).await?);
            tokio::select! {
                _ = udp_server.run() => {}
                _ = shutdown_signal() => info!("Shutdown signal received"),
            }
        }
        Protocol::WebSocket => {
            let listener = TcpListener::bind(&addr).await?;
            info!("WebSocket server listening on {addr}");
            let game_state = GameState::new(database.clone());
            tokio::select! {
                _ = ws_server::run(listener, game_state, database.clone()) => {}
                _ = shutdown_signal() => info!("Shutdown signal received"),
            }
        }
    }

    // The listener is gone at this point; let in-flight handlers drain
    // before the store goes away.
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    database.close().await;
    info!("Shutdown complete");
    Ok(())
}

/// `LOG_LEVEL` sets the default verbosity; `RUST_LOG` overrides it when set.
fn init_logging(log_level: &str) {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(log_level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn spawn_session_sweeper(database: Database) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = database.cleanup_old_sessions(STALE_SESSION_HOURS).await {
                error!("Session sweep failed: {e}");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
