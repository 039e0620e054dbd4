//! Environment-driven server configuration
//!
//! There are no command-line flags; deployments configure the server entirely
//! through environment variables, with defaults suitable for local runs.

use std::env;

/// Which listener the supervisor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    WebSocket,
    Udp,
}

impl Protocol {
    /// Parses a `PROTOCOL` value. Anything other than `udp` selects the
    /// WebSocket listener, matching the permissive default of the deployment
    /// scripts this server ships with.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "udp" => Protocol::Udp,
            _ => Protocol::WebSocket,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::WebSocket => "websocket",
            Protocol::Udp => "udp",
        }
    }
}

/// Runtime configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listening port (`PORT`, default 8080).
    pub port: u16,
    /// Transport selection (`PROTOCOL`, default `websocket`).
    pub protocol: Protocol,
    /// Persistence target (`DATABASE_URL`, default `sqlite:game.db`).
    pub database_url: String,
    /// Logging verbosity (`LOG_LEVEL`, default `info`).
    pub log_level: String,
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// An unparseable `PORT` is an initialization failure; every other
    /// variable falls back to its default.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let port = env::var("PORT").unwrap_or_else(|_| "8080".to_string());
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid PORT value: {port}"))?;

        let protocol = Protocol::parse(
            &env::var("PROTOCOL").unwrap_or_else(|_| "websocket".to_string()),
        );
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:game.db".to_string());
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            port,
            protocol,
            database_url,
            log_level,
        })
    }

    /// Socket address the selected listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}
