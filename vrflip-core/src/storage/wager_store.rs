use crate::error::Result;
use crate::storage::Storage;
use crate::types::AccountId;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Archived snapshot of a wager that reached a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerRecord {
    pub owner: AccountId,
    pub wager_id: String,
    pub state: String,
    pub snapshot: String, // JSON encoded wager
    pub archived_at: DateTime<Utc>,
}

pub struct WagerStore<'a> {
    storage: &'a Storage,
}

impl<'a> WagerStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn archive(&self, record: &WagerRecord) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "INSERT OR REPLACE INTO wagers (owner, wager_id, state, snapshot, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.owner.as_str(),
                record.wager_id,
                record.state,
                record.snapshot,
                record.archived_at.timestamp(),
            ],
        )?;

        tracing::info!(
            "Archived wager {}/{} in state {}",
            record.owner,
            record.wager_id,
            record.state
        );
        Ok(())
    }

    pub async fn load(&self, owner: &AccountId, wager_id: &str) -> Result<Option<WagerRecord>> {
        let conn = self.storage.get_connection().await;

        let record = conn
            .query_row(
                "SELECT owner, wager_id, state, snapshot, archived_at
                 FROM wagers WHERE owner = ?1 AND wager_id = ?2",
                params![owner.as_str(), wager_id],
                |row| {
                    let owner: String = row.get(0)?;
                    Ok(WagerRecord {
                        owner: AccountId::new(owner),
                        wager_id: row.get(1)?,
                        state: row.get(2)?,
                        snapshot: row.get(3)?,
                        archived_at: DateTime::from_timestamp(row.get(4)?, 0)
                            .unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()?;

        Ok(record)
    }

    pub async fn list_by_owner(&self, owner: &AccountId) -> Result<Vec<WagerRecord>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT wager_id, state, snapshot, archived_at
             FROM wagers WHERE owner = ?1 ORDER BY archived_at DESC",
        )?;

        let rows = stmt.query_map(params![owner.as_str()], |row| {
            Ok(WagerRecord {
                owner: owner.clone(),
                wager_id: row.get(0)?,
                state: row.get(1)?,
                snapshot: row.get(2)?,
                archived_at: DateTime::from_timestamp(row.get(3)?, 0).unwrap_or_else(Utc::now),
            })
        })?;

        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }

        Ok(records)
    }
}
