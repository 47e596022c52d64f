//! Branch identities and their on-disk directory names.

/// One of the five branches a tracked inode can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    /// Retained indefinitely (or until a configured keep-threshold untracks it).
    Keep,
    /// Pending archival; the sweep deletes the source and stages the hardlink.
    Archive,
    /// Archival variant that keeps the source file when staged.
    Stash,
    /// Awaiting drain to the external handler.
    Staged,
    /// Soft-deleted; recoverable until the limbo grace period elapses.
    Limbo,
}

impl Branch {
    /// The subdirectory name used under `.vault` for this branch.
    pub fn dir_name(self) -> &'static str {
        match self {
            Branch::Keep => "keep",
            Branch::Archive => "archive",
            Branch::Stash => ".stash",
            Branch::Staged => ".staged",
            Branch::Limbo => ".limbo",
        }
    }

    /// All branches, in a stable order (used when scanning for an inode).
    pub fn all() -> [Branch; 5] {
        [Branch::Keep, Branch::Archive, Branch::Stash, Branch::Staged, Branch::Limbo]
    }

    /// Branches a user's `keep`/`archive`/`stash` CLI verbs may `add` into.
    /// Staged and limbo are terminal for `add` (see §4.2's `AlreadyTracked`).
    pub fn is_user_mutable(self) -> bool {
        matches!(self, Branch::Keep | Branch::Archive | Branch::Stash)
    }

    /// Minimum hardlink count expected for an entry in this branch: every
    /// branch keeps a source alongside the vault hardlink except `limbo`,
    /// where the source has been unlinked.
    pub fn min_link_count(self) -> u64 {
        match self {
            Branch::Limbo => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name().trim_start_matches('.'))
    }
}

/// Scope for `vault list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListContext {
    /// Every entry in the branch.
    All,
    /// Only entries whose original path descends from the caller's cwd.
    Here,
    /// Only entries owned by the calling uid.
    Mine,
}
