//! SQLite implementation of the storage traits
//!
//! Thin wrapper over the `database` module functions.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Pool, Sqlite};

use super::{Message, MessageStore, User, UserDirectory};
use crate::database;

#[derive(Clone)]
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for SqliteBackend {
    async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        database::get_user_by_id(&self.pool, id).await
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        database::get_user_by_username(&self.pool, username).await
    }
}

#[async_trait]
impl MessageStore for SqliteBackend {
    async fn append(&self, sender_id: i64, receiver_id: i64, content: &str) -> Result<Message> {
        database::insert_message(&self.pool, sender_id, receiver_id, content).await
    }

    async fn conversation(&self, user_a: i64, user_b: i64, limit: i64) -> Result<Vec<Message>> {
        database::get_conversation(&self.pool, user_a, user_b, limit).await
    }
}
