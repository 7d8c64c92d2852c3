//! Shared fixtures for server integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lms_chat_server::auth::TokenAuthenticator;
use lms_chat_server::database;
use lms_chat_server::db::sqlite::SqliteBackend;
use lms_chat_server::{ChatServices, InProcessFabric, ServerConfig};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub const TEST_SECRET: &str = "integration-test-secret";

/// Fresh in-memory database with migrations applied.
///
/// A single connection keeps every query on the same in-memory database.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");

    database::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Config with only the required secret set, plus any overrides
pub fn test_config(overrides: &[(&str, &str)]) -> ServerConfig {
    let overrides: Vec<(String, String)> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ServerConfig::from_lookup(|key| {
        if key == "LMS_JWT_SECRET" {
            return Some(TEST_SECRET.to_string());
        }
        overrides
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    })
    .expect("test config should load")
}

pub fn authenticator() -> Arc<TokenAuthenticator> {
    Arc::new(TokenAuthenticator::from_config(&test_config(&[])))
}

/// SQLite directory/store and an in-process fabric
pub fn services(pool: &SqlitePool) -> ChatServices {
    let backend = Arc::new(SqliteBackend::new(pool.clone()));
    ChatServices {
        authenticator: authenticator(),
        directory: backend.clone(),
        store: backend,
        fabric: Arc::new(InProcessFabric::new()),
        outbound_buffer: 16,
        echo_to_sender: false,
    }
}

/// `Authorization` header value for `user_id`
pub fn bearer(user_id: i64) -> String {
    let token = authenticator()
        .issue(user_id, Duration::from_secs(300))
        .expect("Failed to issue token");
    format!("Bearer {}", token)
}

/// Seed alice (id 1) and bob (id 2)
pub async fn seed_users(pool: &SqlitePool) -> (i64, i64) {
    let alice = database::create_user(pool, "alice", "alice@example.com", true)
        .await
        .unwrap();
    let bob = database::create_user(pool, "bob", "bob@example.com", false)
        .await
        .unwrap();
    (alice, bob)
}
