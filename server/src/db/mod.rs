//! Storage abstraction layer
//!
//! The chat core talks to two collaborators through traits: the user
//! directory (read-only lookups) and the message store (append-only).
//! Both are implemented over SQLite by [`sqlite::SqliteBackend`].

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// A user record as seen by the chat core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub is_student: bool,
}

impl User {
    pub(crate) fn from_row((id, username, email, is_student): (i64, String, String, bool)) -> Self {
        Self {
            id,
            username,
            email,
            is_student,
        }
    }
}

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    /// Unix timestamp assigned by the store
    pub sent_at: i64,
}

/// Resolves token subjects and usernames to user records.
///
/// A miss is `Ok(None)`; `Err` is reserved for lookup failures.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn get_by_id(&self, id: i64) -> Result<Option<User>>;
    async fn get_by_username(&self, username: &str) -> Result<Option<User>>;
}

/// Durable, append-only message log
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persist one message atomically; the store assigns id and timestamp
    async fn append(&self, sender_id: i64, receiver_id: i64, content: &str) -> Result<Message>;

    /// Most recent `limit` messages between two users, oldest first
    async fn conversation(&self, user_a: i64, user_b: i64, limit: i64) -> Result<Vec<Message>>;
}
