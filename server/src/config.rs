//! Server configuration

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Database URL
    pub database_url: String,
    /// Shared secret used to verify bearer tokens
    pub jwt_secret: String,
    /// Token signing algorithm (HMAC family only)
    pub jwt_algorithm: jsonwebtoken::Algorithm,
    /// Clock-skew tolerance for token expiry, in seconds
    pub jwt_leeway_seconds: u64,
    /// Maximum inbound frame size in bytes
    pub max_message_size: usize,
    /// WebSocket ping interval in seconds
    pub ws_ping_interval: u64,
    /// Per-connection delivery queue capacity
    pub outbound_buffer: usize,
    /// Maximum total WebSocket connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum WebSocket connections per IP address (0 = unlimited)
    pub max_connections_per_ip: usize,
    /// Inbound chat frame burst allowance per connection (0 = no rate limit)
    pub rate_limit_burst: f64,
    /// Inbound chat frames refilled per second per connection
    pub rate_limit_per_sec: f64,
    /// Maximum rows returned by the history endpoint
    pub history_limit: i64,
    /// Also deliver each message to the sender's own inbox
    pub echo_to_sender: bool,
    /// Comma-separated list of allowed CORS origins (empty = permissive)
    pub cors_origins: Option<String>,
    /// Bearer token for /admin/* endpoints (None = endpoints hidden)
    pub admin_token: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_algorithm = jsonwebtoken::Algorithm::from_str(&var("LMS_JWT_ALGORITHM", "HS256"))
            .context("Invalid LMS_JWT_ALGORITHM")?;
        if !matches!(
            jwt_algorithm,
            jsonwebtoken::Algorithm::HS256
                | jsonwebtoken::Algorithm::HS384
                | jsonwebtoken::Algorithm::HS512
        ) {
            anyhow::bail!("LMS_JWT_ALGORITHM must be HS256, HS384 or HS512 (shared secret)");
        }

        let jwt_secret = lookup("LMS_JWT_SECRET").context("LMS_JWT_SECRET is not set")?;
        if jwt_secret.is_empty() {
            anyhow::bail!("LMS_JWT_SECRET must not be empty");
        }

        let config = ServerConfig {
            host: var("LMS_HOST", "0.0.0.0"),
            port: var("LMS_PORT", "8000")
                .parse()
                .context("Invalid LMS_PORT")?,
            database_url: var("LMS_DATABASE_URL", "sqlite://./data/lms_chat.db"),
            jwt_secret,
            jwt_algorithm,
            jwt_leeway_seconds: var("LMS_JWT_LEEWAY", "0")
                .parse()
                .context("Invalid LMS_JWT_LEEWAY")?,
            max_message_size: var("LMS_MAX_MESSAGE_SIZE", "65536") // 64KB
                .parse()
                .context("Invalid LMS_MAX_MESSAGE_SIZE")?,
            ws_ping_interval: var("LMS_WS_PING_INTERVAL", "30")
                .parse()
                .context("Invalid LMS_WS_PING_INTERVAL")?,
            outbound_buffer: var("LMS_OUTBOUND_BUFFER", "64")
                .parse()
                .context("Invalid LMS_OUTBOUND_BUFFER")?,
            max_connections: var("LMS_MAX_CONNECTIONS", "2000")
                .parse()
                .context("Invalid LMS_MAX_CONNECTIONS")?,
            max_connections_per_ip: var("LMS_MAX_CONNECTIONS_PER_IP", "20")
                .parse()
                .context("Invalid LMS_MAX_CONNECTIONS_PER_IP")?,
            rate_limit_burst: var("LMS_RATE_LIMIT_BURST", "0")
                .parse()
                .context("Invalid LMS_RATE_LIMIT_BURST")?,
            rate_limit_per_sec: var("LMS_RATE_LIMIT_PER_SEC", "10")
                .parse()
                .context("Invalid LMS_RATE_LIMIT_PER_SEC")?,
            history_limit: var("LMS_HISTORY_LIMIT", "100")
                .parse()
                .context("Invalid LMS_HISTORY_LIMIT")?,
            echo_to_sender: var("LMS_ECHO_TO_SENDER", "false")
                .parse()
                .context("Invalid LMS_ECHO_TO_SENDER")?,
            cors_origins: lookup("LMS_CORS_ORIGINS"),
            admin_token: lookup("LMS_ADMIN_TOKEN"),
        };

        if config.outbound_buffer == 0 {
            anyhow::bail!("LMS_OUTBOUND_BUFFER must be at least 1");
        }
        if config.ws_ping_interval == 0 {
            anyhow::bail!("LMS_WS_PING_INTERVAL must be at least 1");
        }
        if !(config.rate_limit_burst >= 0.0 && config.rate_limit_per_sec >= 0.0) {
            anyhow::bail!("LMS_RATE_LIMIT_BURST and LMS_RATE_LIMIT_PER_SEC must not be negative");
        }

        Ok(config)
    }
}
