//! Error taxonomy for the vault and sweep/drain machinery.
//!
//! Each module gets its own error enum so that callers can match on the
//! specific failure instead of a single flat bag of variants; the sweeper
//! (the one caller that sees all of them) folds them into [`SweepError`].

use std::path::PathBuf;

/// Errors raised by the vault key codec.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("malformed vault key {0:?}")]
    MalformedKey(PathBuf),
}

/// Errors raised by vault operations (`add`, `move`, `remove`, `list`, `lookup`, `locate`).
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("no vault covers {0:?}")]
    NoVault(PathBuf),
    #[error("{0:?} is itself a vault root")]
    IsVault(PathBuf),
    #[error("{0:?} is not a regular file")]
    NotRegular(PathBuf),
    #[error("permission precondition not met for {path:?}: {reason}")]
    PermissionDenied { path: PathBuf, reason: String },
    #[error("{0:?} is not tracked in the expected branch")]
    NotTracked(PathBuf),
    #[error("inode {inode} is already tracked in branch {existing_branch}")]
    AlreadyTracked { inode: u64, existing_branch: String },
    #[error("vault corruption at {0:?}: {1}")]
    VaultCorruption(PathBuf, String),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("cannot attach a warning to a status that is not `warned`: status {0}")]
    WarningOnNonWarnedStatus(i64),
}

/// Errors raised while dispatching e-mail or resolving identities; fatal ones
/// propagate straight out of the sweep (see `NoSuchIdentity` in the spec's §7).
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity directory has no record for uid {0}")]
    NoSuchIdentity(u32),
    #[error("identity backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail transport error: {0}")]
    Transport(String),
}

/// Errors that stop the sweeper outright: the consensus gate disagreeing,
/// an identity lookup failing, or vault corruption the sweeper can't repair.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("consensus predicates disagreed for inode {inode}: {votes:?}")]
    ConsensusFailed { inode: u64, votes: Vec<bool> },
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Mail(#[from] MailError),
}

/// Errors raised by the drainer's handler probe/stream.
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("downstream handler reported busy")]
    HandlerBusy,
    #[error("downstream handler reported insufficient capacity")]
    HandlerNoCapacity,
    #[error("downstream handler failed: {0}")]
    HandlerFailed(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("I/O error talking to handler: {0}")]
    Io(#[from] std::io::Error),
}
