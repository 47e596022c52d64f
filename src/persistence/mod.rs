//! Relational persistence: the file/status/warning/notification bookkeeping
//! described in §3/§3.1, backed by PostgreSQL via `sqlx`.
//!
//! Queries are written against the non-macro `sqlx` API (`query_as`/`bind`)
//! rather than the `query!` compile-time-checked macros, since those require
//! a live database (or an offline query cache) reachable at build time.

mod models;

pub use models::{FileRecord, Status, StatusState, Warning};

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

use crate::error::PersistenceError;

/// A handle onto the Postgres connection pool plus the query surface the
/// sweeper and drainer need.
#[derive(Debug, Clone)]
pub struct Persistence {
    pool: PgPool,
}

impl Persistence {
    pub async fn connect(connection_string: &str) -> Result<Self, PersistenceError> {
        let pool = PgPool::connect(connection_string).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Opens a transaction scoping one sweep decision's writes (status,
    /// warning, notification, staging, and file-record rows): §4.4/§5
    /// require that a crash mid-decision can't leave a status row without
    /// the notification/queue rows it implies.
    pub async fn begin(&self) -> Result<PersistenceTx<'_>, PersistenceError> {
        Ok(PersistenceTx { tx: self.pool.begin().await? })
    }

    /// Mirrors the identity directory's `group_owners(gid)` into the
    /// `groups`/`group_owners` tables so `stakeholders()` below reflects
    /// reality instead of reading an always-empty table.
    pub async fn sync_group_owners(&self, gid: i64, group_name: &str, owner_uids: &[i64]) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO groups (gid, name) VALUES ($1, $2) ON CONFLICT (gid) DO UPDATE SET name = EXCLUDED.name")
            .bind(gid)
            .bind(group_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM group_owners WHERE gid = $1").bind(gid).execute(&mut *tx).await?;
        for uid in owner_uids {
            sqlx::query("INSERT INTO group_owners (gid, owner_uid) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(gid)
                .bind(uid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn find_file(&self, device: i64, inode: i64) -> Result<Option<FileRecord>, PersistenceError> {
        let row = sqlx::query_as::<_, FileRecord>(
            "SELECT device, inode, source_path, vault_key, mtime, owner_uid, group_gid, size_bytes
             FROM files WHERE device = $1 AND inode = $2",
        )
        .bind(device)
        .bind(inode)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Whether a `warned` status already exists for this file at this
    /// checkpoint, timestamped at or after `since_mtime` (an mtime reset
    /// re-arms the checkpoint).
    pub async fn has_current_warning(
        &self,
        device: i64,
        inode: i64,
        tminus_hours: i32,
        since_mtime: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM statuses s
             JOIN warnings w ON w.status_id = s.id
             WHERE s.device = $1 AND s.inode = $2 AND s.state = 'warned'
               AND w.tminus_hours = $3 AND s.occurred_at >= $4",
        )
        .bind(device)
        .bind(inode)
        .bind(tminus_hours)
        .bind(since_mtime)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    /// The union of owner uid and the file's group's owner uids.
    pub async fn stakeholders(&self, owner_uid: i64, group_gid: i64) -> Result<Vec<i64>, PersistenceError> {
        let rows = sqlx::query("SELECT owner_uid FROM group_owners WHERE gid = $1")
            .bind(group_gid)
            .fetch_all(&self.pool)
            .await?;
        let mut uids: Vec<i64> = rows.iter().map(|r| r.get("owner_uid")).collect();
        if !uids.contains(&owner_uid) {
            uids.push(owner_uid);
        }
        Ok(uids)
    }

    /// Whether every stakeholder of a status has a notification row for it.
    pub async fn status_fully_notified(&self, status_id: i64, stakeholders: &[i64]) -> Result<bool, PersistenceError> {
        if stakeholders.is_empty() {
            return Ok(true);
        }
        let row = sqlx::query("SELECT COUNT(DISTINCT stakeholder_uid) AS n FROM notifications WHERE status_id = $1")
            .bind(status_id)
            .fetch_one(&self.pool)
            .await?;
        let notified: i64 = row.get("n");
        Ok(notified as usize >= stakeholders.len())
    }

    /// Enqueues a staged file for drain.
    pub async fn enqueue_staged(
        &self,
        status_id: i64,
        device: i64,
        inode: i64,
        staged_path: &str,
        queued_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO staged_queue (status_id, device, inode, staged_path, queued_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(status_id)
        .bind(device)
        .bind(inode)
        .bind(staged_path)
        .bind(queued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn staged_backlog(&self) -> Result<Vec<(i64, String)>, PersistenceError> {
        let rows = sqlx::query("SELECT status_id, staged_path FROM staged_queue ORDER BY queued_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| (r.get("status_id"), r.get("staged_path"))).collect())
    }

    pub async fn staged_backlog_total_bytes(&self) -> Result<i64, PersistenceError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(f.size_bytes), 0) AS total FROM staged_queue q
             JOIN files f ON f.device = q.device AND f.inode = q.inode",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("total"))
    }

    /// Removes a drained row: the handler is responsible for unlinking the
    /// physical hardlink, this only retires the bookkeeping.
    pub async fn retire_staged(&self, status_id: i64) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM staged_queue WHERE status_id = $1").bind(status_id).execute(&self.pool).await?;
        sqlx::query("DELETE FROM statuses WHERE id = $1").bind(status_id).execute(&self.pool).await?;
        Ok(())
    }

    /// Purges a file whose `deleted` status is fully notified: its prior
    /// non-deleted statuses are cascaded away with it via the FK.
    pub async fn purge_fully_notified_deletions(&self) -> Result<u64, PersistenceError> {
        let rows = sqlx::query(
            "SELECT f.device, f.inode FROM files f
             JOIN statuses s ON s.device = f.device AND s.inode = f.inode AND s.state = 'deleted'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut purged = 0;
        for row in rows {
            let device: i64 = row.get("device");
            let inode: i64 = row.get("inode");
            let status_row = sqlx::query(
                "SELECT id FROM statuses WHERE device = $1 AND inode = $2 AND state = 'deleted'
                 ORDER BY occurred_at DESC LIMIT 1",
            )
            .bind(device)
            .bind(inode)
            .fetch_one(&self.pool)
            .await?;
            let status_id: i64 = status_row.get("id");

            let file = self.find_file(device, inode).await?;
            let Some(file) = file else { continue };
            let stakeholders = self.stakeholders(file.owner_uid, file.group_gid).await?;
            if self.status_fully_notified(status_id, &stakeholders).await? {
                sqlx::query("DELETE FROM files WHERE device = $1 AND inode = $2")
                    .bind(device)
                    .bind(inode)
                    .execute(&self.pool)
                    .await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Expires files whose every non-staged status is fully notified and
    /// older than 90 days.
    pub async fn expire_stale_files(&self, now: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let cutoff = now - chrono::Duration::days(90);
        let files = sqlx::query_as::<_, FileRecord>(
            "SELECT device, inode, source_path, vault_key, mtime, owner_uid, group_gid, size_bytes FROM files",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut expired = 0;
        for file in files {
            let statuses = sqlx::query(
                "SELECT id, state, occurred_at FROM statuses WHERE device = $1 AND inode = $2 AND state != 'staged'",
            )
            .bind(file.device)
            .bind(file.inode)
            .fetch_all(&self.pool)
            .await?;
            if statuses.is_empty() {
                continue;
            }
            let stakeholders = self.stakeholders(file.owner_uid, file.group_gid).await?;
            let mut all_old_and_notified = true;
            for status in &statuses {
                let occurred_at: DateTime<Utc> = status.get("occurred_at");
                if occurred_at > cutoff {
                    all_old_and_notified = false;
                    break;
                }
                let status_id: i64 = status.get("id");
                if !self.status_fully_notified(status_id, &stakeholders).await? {
                    all_old_and_notified = false;
                    break;
                }
            }
            if all_old_and_notified {
                sqlx::query("DELETE FROM files WHERE device = $1 AND inode = $2")
                    .bind(file.device)
                    .bind(file.inode)
                    .execute(&self.pool)
                    .await?;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

async fn upsert_file_exec(conn: &mut PgConnection, file: &FileRecord) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO files (device, inode, source_path, vault_key, mtime, owner_uid, group_gid, size_bytes)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (device, inode) DO UPDATE SET
           source_path = EXCLUDED.source_path, vault_key = EXCLUDED.vault_key, mtime = EXCLUDED.mtime,
           owner_uid = EXCLUDED.owner_uid, group_gid = EXCLUDED.group_gid, size_bytes = EXCLUDED.size_bytes",
    )
    .bind(file.device)
    .bind(file.inode)
    .bind(&file.source_path)
    .bind(&file.vault_key)
    .bind(file.mtime)
    .bind(file.owner_uid)
    .bind(file.group_gid)
    .bind(file.size_bytes)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn append_status_exec(
    conn: &mut PgConnection,
    device: i64,
    inode: i64,
    state: StatusState,
    occurred_at: DateTime<Utc>,
) -> Result<i64, PersistenceError> {
    let row = sqlx::query(
        "INSERT INTO statuses (device, inode, state, occurred_at) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(device)
    .bind(inode)
    .bind(state.as_str())
    .bind(occurred_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.get::<i64, _>("id"))
}

/// Refuses (application-level guard, since Postgres CHECKs can't reference
/// sibling rows) if the named status is not itself `warned`.
async fn append_warning_exec(conn: &mut PgConnection, status_id: i64, tminus_hours: i32) -> Result<(), PersistenceError> {
    let state: String = sqlx::query("SELECT state FROM statuses WHERE id = $1")
        .bind(status_id)
        .fetch_one(&mut *conn)
        .await?
        .get("state");
    if state != StatusState::Warned.as_str() {
        return Err(PersistenceError::WarningOnNonWarnedStatus(status_id));
    }
    sqlx::query("INSERT INTO warnings (status_id, tminus_hours) VALUES ($1, $2)")
        .bind(status_id)
        .bind(tminus_hours)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn append_notification_exec(
    conn: &mut PgConnection,
    status_id: i64,
    stakeholder_uid: i64,
    notified_at: DateTime<Utc>,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO notifications (status_id, stakeholder_uid, notified_at) VALUES ($1, $2, $3)
         ON CONFLICT (status_id, stakeholder_uid) DO NOTHING",
    )
    .bind(status_id)
    .bind(stakeholder_uid)
    .bind(notified_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn enqueue_staged_exec(
    conn: &mut PgConnection,
    status_id: i64,
    device: i64,
    inode: i64,
    staged_path: &str,
    queued_at: DateTime<Utc>,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO staged_queue (status_id, device, inode, staged_path, queued_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(status_id)
    .bind(device)
    .bind(inode)
    .bind(staged_path)
    .bind(queued_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// A transaction scoping one sweep decision's writes. Opened via
/// [`Persistence::begin`] and committed once per file/decision, so a crash
/// mid-decision can't leave a status row without the notification/queue rows
/// it implies (§4.4/§5).
pub struct PersistenceTx<'a> {
    tx: Transaction<'a, Postgres>,
}

impl<'a> PersistenceTx<'a> {
    pub async fn upsert_file(&mut self, file: &FileRecord) -> Result<(), PersistenceError> {
        upsert_file_exec(&mut self.tx, file).await
    }

    pub async fn append_status(
        &mut self,
        device: i64,
        inode: i64,
        state: StatusState,
        occurred_at: DateTime<Utc>,
    ) -> Result<i64, PersistenceError> {
        append_status_exec(&mut self.tx, device, inode, state, occurred_at).await
    }

    pub async fn append_warning(&mut self, status_id: i64, tminus_hours: i32) -> Result<(), PersistenceError> {
        append_warning_exec(&mut self.tx, status_id, tminus_hours).await
    }

    pub async fn append_notification(
        &mut self,
        status_id: i64,
        stakeholder_uid: i64,
        notified_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        append_notification_exec(&mut self.tx, status_id, stakeholder_uid, notified_at).await
    }

    pub async fn enqueue_staged(
        &mut self,
        status_id: i64,
        device: i64,
        inode: i64,
        staged_path: &str,
        queued_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        enqueue_staged_exec(&mut self.tx, status_id, device, inode, staged_path, queued_at).await
    }

    pub async fn commit(self) -> Result<(), PersistenceError> {
        self.tx.commit().await?;
        Ok(())
    }
}
