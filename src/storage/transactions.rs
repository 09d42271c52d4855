use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use super::Storage;

/// A command a user ran and what the bot answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub uid: String,
    pub input: String,
    pub bot_username: String,
    pub reply: String,
}

#[async_trait]
pub trait TransactionLog: Send + Sync {
    async fn log(&self, transaction: &Transaction) -> Result<()>;
}

/// Writes transactions to the `transactions` table.
#[derive(Clone)]
pub struct SqliteTransactionLog {
    storage: Storage,
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct LoggedTransaction {
    pub id: String,
    pub transaction: Transaction,
    pub created_at: String,
}

impl SqliteTransactionLog {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn connection(&self) -> Result<std::sync::Arc<tokio::sync::Mutex<Connection>>> {
        self.storage
            .connection()
            .context("Storage is not ready; transaction not recorded")
    }

    /// Most recent transactions first.
    #[cfg(test)]
    pub async fn recent(&self, limit: usize) -> Result<Vec<LoggedTransaction>> {
        let conn = self.connection()?;
        let conn = conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, uid, input, bot_username, reply, created_at
                 FROM transactions
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?1",
            )
            .context("Failed to prepare transactions query")?;
        let rows = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                Ok(LoggedTransaction {
                    id: row.get(0)?,
                    transaction: Transaction {
                        uid: row.get(1)?,
                        input: row.get(2)?,
                        bot_username: row.get(3)?,
                        reply: row.get(4)?,
                    },
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to map rows")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect rows")?;
        Ok(rows)
    }
}

#[async_trait]
impl TransactionLog for SqliteTransactionLog {
    async fn log(&self, transaction: &Transaction) -> Result<()> {
        info!(
            "[{}] {} -> {}: {}",
            transaction.uid, transaction.input, transaction.bot_username, transaction.reply
        );

        let conn = self.connection()?;
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO transactions (id, uid, input, bot_username, reply, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                transaction.uid,
                transaction.input,
                transaction.bot_username,
                transaction.reply,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert transaction")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_transaction(input: &str, reply: &str) -> Transaction {
        Transaction {
            uid: "console-bob".to_string(),
            input: input.to_string(),
            bot_username: "scarecrow".to_string(),
            reply: reply.to_string(),
        }
    }

    #[tokio::test]
    async fn test_log_and_list_recent() {
        let log = SqliteTransactionLog::new(Storage::open_in_memory().unwrap());

        log.log(&make_transaction("!reload", "Brain reloaded!"))
            .await
            .unwrap();
        log.log(&make_transaction("!op carol", "carol added to the admins list."))
            .await
            .unwrap();

        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].transaction.input, "!op carol");
        assert_eq!(recent[1].transaction.reply, "Brain reloaded!");

        assert_eq!(log.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_log_without_storage_fails() {
        let log = SqliteTransactionLog::new(Storage::unavailable());
        let err = log
            .log(&make_transaction("!halt", "Shutting down..."))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }
}
