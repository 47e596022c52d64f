//! Row types for the persistence schema (§3.1).

use chrono::{DateTime, Utc};

/// A file record: (device, inode) plus the attributes observed last time the
/// walker or vault saw it. Immutable once inserted — a change of facts means
/// delete-and-reinsert (`upsert_file` replaces the whole row).
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FileRecord {
    pub device: i64,
    pub inode: i64,
    pub source_path: String,
    pub vault_key: Option<String>,
    pub mtime: DateTime<Utc>,
    pub owner_uid: i64,
    pub group_gid: i64,
    pub size_bytes: i64,
}

/// The three states a status event can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Warned,
    Staged,
    Deleted,
}

impl StatusState {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusState::Warned => "warned",
            StatusState::Staged => "staged",
            StatusState::Deleted => "deleted",
        }
    }
}

/// A status event row: one per transition, not a latched state.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Status {
    pub id: i64,
    pub device: i64,
    pub inode: i64,
    pub state: String,
    pub occurred_at: DateTime<Utc>,
}

/// A warning row, 1-to-1 with a `warned` status.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Warning {
    pub status_id: i64,
    pub tminus_hours: i32,
}
