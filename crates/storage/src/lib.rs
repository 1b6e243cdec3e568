use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::ClientId;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// One persisted private message. `address` is the recipient, `sender` the
/// author; the column names are the wire names of the `private` envelope's
/// `to` and `from` fields.
#[derive(Debug, Clone)]
pub struct StoredPrivateMessage {
    pub address: ClientId,
    pub sender: ClientId,
    pub text: String,
    pub stored_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_messages_table().await?;
        Ok(storage)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_messages_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                sender  TEXT NOT NULL,
                text    TEXT NOT NULL,
                dt      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure messages table exists")?;
        Ok(())
    }

    pub async fn store_private_message(
        &self,
        address: &ClientId,
        sender: &ClientId,
        text: &str,
    ) -> Result<i64> {
        let rec = sqlx::query(
            "INSERT INTO messages (address, sender, text, dt) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(address.as_str())
        .bind(sender.as_str())
        .bind(text)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.get::<i64, _>(0))
    }

    /// Every message either party addressed to the other, oldest first.
    pub async fn history_between(
        &self,
        a: &ClientId,
        b: &ClientId,
    ) -> Result<Vec<StoredPrivateMessage>> {
        let rows = sqlx::query(
            "SELECT address, sender, text, dt FROM messages
             WHERE address IN (?, ?) AND sender IN (?, ?)
             ORDER BY dt, id",
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .bind(a.as_str())
        .bind(b.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredPrivateMessage {
                address: ClientId::new(row.get::<String, _>("address")),
                sender: ClientId::new(row.get::<String, _>("sender")),
                text: row.get::<String, _>("text"),
                stored_at: row.get::<DateTime<Utc>, _>("dt"),
            })
            .collect())
    }

    /// Delete the stored conversation between the pair; returns the number
    /// of removed rows.
    pub async fn purge_history(&self, a: &ClientId, b: &ClientId) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM messages WHERE address IN (?, ?) AND sender IN (?, ?)",
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .bind(a.as_str())
        .bind(b.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
