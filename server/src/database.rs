//! Database operations

use std::path::Path;

use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;

use crate::db::{Message, User};

/// Initialize the database connection pool
pub async fn init(database_url: &str) -> Result<Pool<Sqlite>> {
    // Create database file (and its directory) if it doesn't exist
    if !sqlx::Sqlite::database_exists(database_url).await.unwrap_or(false) {
        if let Some(parent) = database_file(database_url).and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        info!("Creating database at {}", database_url);
        sqlx::Sqlite::create_database(database_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Filesystem path behind a `sqlite:` URL, if it names a file
fn database_file(database_url: &str) -> Option<&Path> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next()?;
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(Path::new(path))
}

/// Run database migrations
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    info!("Running database migrations");

    // Mirror of the LMS user table; rows are owned by the user service
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            is_student INTEGER NOT NULL DEFAULT 1,
            date_joined INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
        );
        "#
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id INTEGER NOT NULL,
            receiver_id INTEGER NOT NULL,
            content TEXT NOT NULL,
            sent_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
            FOREIGN KEY (sender_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY (receiver_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_pair
        ON messages(sender_id, receiver_id, id);
        "#
    )
    .execute(pool)
    .await?;

    // Messages are append-only
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS messages_no_update
        BEFORE UPDATE ON messages
        BEGIN
            SELECT RAISE(ABORT, 'messages are append-only');
        END;
        "#
    )
    .execute(pool)
    .await?;

    info!("Migrations completed successfully");
    Ok(())
}

/// Insert a user and return its id
pub async fn create_user(
    pool: &Pool<Sqlite>,
    username: &str,
    email: &str,
    is_student: bool,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO users (username, email, is_student)
        VALUES (?1, ?2, ?3)
        "#
    )
    .bind(username)
    .bind(email)
    .bind(is_student)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Look a user up by primary key
pub async fn get_user_by_id(pool: &Pool<Sqlite>, id: i64) -> Result<Option<User>> {
    let row: Option<(i64, String, String, bool)> = sqlx::query_as(
        "SELECT id, username, email, is_student FROM users WHERE id = ?1"
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(User::from_row))
}

/// Look a user up by exact username
pub async fn get_user_by_username(pool: &Pool<Sqlite>, username: &str) -> Result<Option<User>> {
    let row: Option<(i64, String, String, bool)> = sqlx::query_as(
        "SELECT id, username, email, is_student FROM users WHERE username = ?1"
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(User::from_row))
}

/// Append a message. The database assigns `id` and `sent_at`.
pub async fn insert_message(
    pool: &Pool<Sqlite>,
    sender_id: i64,
    receiver_id: i64,
    content: &str,
) -> Result<Message> {
    let (id, sent_at): (i64, i64) = sqlx::query_as(
        r#"
        INSERT INTO messages (sender_id, receiver_id, content)
        VALUES (?1, ?2, ?3)
        RETURNING id, sent_at
        "#
    )
    .bind(sender_id)
    .bind(receiver_id)
    .bind(content)
    .fetch_one(pool)
    .await?;

    Ok(Message {
        id,
        sender_id,
        receiver_id,
        content: content.to_string(),
        sent_at,
    })
}

/// Most recent `limit` messages exchanged between two users, oldest first
pub async fn get_conversation(
    pool: &Pool<Sqlite>,
    user_a: i64,
    user_b: i64,
    limit: i64,
) -> Result<Vec<Message>> {
    let rows = sqlx::query_as::<_, (i64, i64, i64, String, i64)>(
        r#"
        SELECT id, sender_id, receiver_id, content, sent_at FROM (
            SELECT id, sender_id, receiver_id, content, sent_at
            FROM messages
            WHERE (sender_id = ?1 AND receiver_id = ?2)
               OR (sender_id = ?2 AND receiver_id = ?1)
            ORDER BY id DESC
            LIMIT ?3
        )
        ORDER BY id ASC
        "#
    )
    .bind(user_a)
    .bind(user_b)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, sender_id, receiver_id, content, sent_at)| Message {
            id,
            sender_id,
            receiver_id,
            content,
            sent_at,
        })
        .collect())
}

/// Count messages sent from one user to another
pub async fn count_messages(pool: &Pool<Sqlite>, sender_id: i64, receiver_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE sender_id = ?1 AND receiver_id = ?2"
    )
    .bind(sender_id)
    .bind(receiver_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}
