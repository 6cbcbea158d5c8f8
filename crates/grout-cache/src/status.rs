//! BIOS availability and per-platform sync status

use crate::store::CacheStore;
use crate::{CacheError, Entity};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, params};
use std::fmt;

/// Outcome of the last games fetch for a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSyncState {
    Pending,
    Ok,
    Failed,
}

impl PlatformSyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformSyncState::Pending => "pending",
            PlatformSyncState::Ok => "ok",
            PlatformSyncState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PlatformSyncState::Pending),
            "ok" => Some(PlatformSyncState::Ok),
            "failed" => Some(PlatformSyncState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PlatformSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSyncStatus {
    pub platform_id: i64,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub last_attempt: DateTime<Utc>,
    pub games_synced: i64,
    pub state: PlatformSyncState,
}

impl CacheStore {
    /// Record BIOS availability; the platform row is kept in step
    pub fn set_bios_availability(&self, platform_id: i64, has_bios: bool) -> Result<(), CacheError> {
        self.write("set", Entity::Bios, platform_id, |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO bios_availability (platform_id, has_bios, checked_at) VALUES (?1, ?2, ?3)",
                params![platform_id, has_bios, Utc::now()],
            )?;
            tx.execute(
                "UPDATE platforms SET has_bios = ?1 WHERE id = ?2",
                params![has_bios, platform_id],
            )?;
            Ok(())
        })
    }

    /// `None` when availability was never checked
    pub fn has_bios(&self, platform_id: i64) -> Result<Option<bool>, CacheError> {
        self.read("get", Entity::Bios, platform_id, |conn| {
            conn.query_row(
                "SELECT has_bios FROM bios_availability WHERE platform_id = ?1",
                params![platform_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn mark_platform_sync_pending(&self, platform_id: i64) -> Result<(), CacheError> {
        self.write("pending", Entity::SyncStatus, platform_id, |tx| {
            tx.execute(
                r#"INSERT INTO platform_sync_status (platform_id, last_attempt, status)
                   VALUES (?1, ?2, 'pending')
                   ON CONFLICT (platform_id) DO UPDATE SET
                       last_attempt = excluded.last_attempt,
                       status = 'pending'"#,
                params![platform_id, Utc::now()],
            )?;
            Ok(())
        })
    }

    pub fn record_platform_sync_success(&self, platform_id: i64, games_synced: i64) -> Result<(), CacheError> {
        let now = Utc::now();
        self.write("success", Entity::SyncStatus, platform_id, |tx| {
            tx.execute(
                r#"INSERT OR REPLACE INTO platform_sync_status
                   (platform_id, last_successful_sync, last_attempt, games_synced, status)
                   VALUES (?1, ?2, ?2, ?3, 'ok')"#,
                params![platform_id, now, games_synced],
            )?;
            Ok(())
        })
    }

    /// Record a failed attempt; the last success is kept
    pub fn record_platform_sync_failure(&self, platform_id: i64) -> Result<(), CacheError> {
        self.write("failure", Entity::SyncStatus, platform_id, |tx| {
            tx.execute(
                r#"INSERT INTO platform_sync_status (platform_id, last_attempt, status)
                   VALUES (?1, ?2, 'failed')
                   ON CONFLICT (platform_id) DO UPDATE SET
                       last_attempt = excluded.last_attempt,
                       status = 'failed'"#,
                params![platform_id, Utc::now()],
            )?;
            Ok(())
        })
    }

    pub fn platform_sync_status(&self, platform_id: i64) -> Result<Option<PlatformSyncStatus>, CacheError> {
        self.read("get", Entity::SyncStatus, platform_id, |conn| {
            conn.query_row(
                r#"SELECT platform_id, last_successful_sync, last_attempt, games_synced, status
                   FROM platform_sync_status WHERE platform_id = ?1"#,
                params![platform_id],
                |row| {
                    let status: String = row.get(4)?;
                    let state = PlatformSyncState::parse(&status).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            4,
                            Type::Text,
                            format!("unknown status {status}").into(),
                        )
                    })?;
                    Ok(PlatformSyncStatus {
                        platform_id: row.get(0)?,
                        last_successful_sync: row.get(1)?,
                        last_attempt: row.get(2)?,
                        games_synced: row.get(3)?,
                        state,
                    })
                },
            )
            .optional()
        })
    }

    /// Platforms whose last attempt failed
    pub fn failed_platform_ids(&self) -> Result<Vec<i64>, CacheError> {
        self.read("failed", Entity::SyncStatus, "*", |conn| {
            let mut stmt = conn.prepare(
                "SELECT platform_id FROM platform_sync_status WHERE status = 'failed' ORDER BY platform_id",
            )?;
            stmt.query_map([], |row| row.get(0))?.collect()
        })
    }
}
