pub mod balance_store;
pub mod wager_store;

pub use balance_store::BalanceStore;
pub use wager_store::{WagerRecord, WagerStore};

use crate::error::{CoreError, Result};
use rusqlite::Connection;
use std::path::Path;
use tokio::sync::Mutex;

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::internal(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema().await?;
        Ok(storage)
    }

    pub async fn in_memory() -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };

        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        // Asset balances table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS balances (
                account TEXT PRIMARY KEY,
                amount INTEGER NOT NULL CHECK (amount >= 0),
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Archived wagers table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS wagers (
                owner TEXT NOT NULL,
                wager_id TEXT NOT NULL,
                state TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                archived_at INTEGER NOT NULL,
                PRIMARY KEY (owner, wager_id)
            )",
            [],
        )?;

        Ok(())
    }

    pub async fn get_connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
