//! The on-disk vault: a `.vault` directory at the root of a homogroupic
//! subtree, holding branch subdirectories (`keep`, `archive`, `.stash`,
//! `.staged`, `.limbo`) whose contents are hardlinks keyed by [`crate::key`].

mod branch;
mod ops;

pub use branch::{Branch, ListContext};
pub use ops::ConsistencyIssue;

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::VaultError;

/// Name of the vault directory under a homogroupic subtree's root.
pub const VAULT_DIR_NAME: &str = ".vault";

/// A handle onto a single group's vault.
#[derive(Debug, Clone)]
pub struct Vault {
    /// The homogroupic subtree root (parent of `.vault`).
    root: PathBuf,
}

impl Vault {
    /// Climbs from `reference_path` to the highest ancestor sharing its gid,
    /// and returns the vault rooted there. Fails with [`VaultError::NoVault`]
    /// if no ancestor qualifies, or [`VaultError::IsVault`] if the reference
    /// itself is a `.vault` directory.
    pub fn locate(reference_path: &Path) -> Result<Vault, VaultError> {
        let reference_path = reference_path
            .canonicalize()
            .map_err(|source| VaultError::Io { path: reference_path.to_path_buf(), source })?;

        if reference_path.file_name().map(|n| n == VAULT_DIR_NAME).unwrap_or(false) {
            return Err(VaultError::IsVault(reference_path));
        }

        let reference_meta = fs::metadata(&reference_path)
            .map_err(|source| VaultError::Io { path: reference_path.clone(), source })?;
        let gid = reference_meta.gid();

        let mut highest_homogroupic: Option<PathBuf> = None;
        let mut cursor: &Path = &reference_path;
        while let Ok(meta) = fs::metadata(cursor) {
            if meta.gid() != gid {
                break;
            }
            highest_homogroupic = Some(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) if parent != cursor => cursor = parent,
                _ => break,
            }
        }

        let root = highest_homogroupic.ok_or_else(|| VaultError::NoVault(reference_path.clone()))?;
        let vault_dir = root.join(VAULT_DIR_NAME);
        if !vault_dir.is_dir() {
            return Err(VaultError::NoVault(reference_path));
        }
        Ok(Vault { root })
    }

    /// The homogroupic subtree root this vault is rooted under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the `.vault` directory itself.
    pub fn vault_dir(&self) -> PathBuf {
        self.root.join(VAULT_DIR_NAME)
    }

    /// Path to a branch directory, creating it (with setgid and inherited
    /// group) if it does not already exist.
    pub fn ensure_branch_dir(&self, branch: Branch) -> Result<PathBuf, VaultError> {
        let vault_dir = self.vault_dir();
        let root_meta = fs::metadata(&self.root)
            .map_err(|source| VaultError::Io { path: self.root.clone(), source })?;

        if !vault_dir.is_dir() {
            create_setgid_dir(&vault_dir, root_meta.gid())?;
        }
        let branch_dir = vault_dir.join(branch.dir_name());
        if !branch_dir.is_dir() {
            create_setgid_dir(&branch_dir, root_meta.gid())?;
        }
        Ok(branch_dir)
    }

    pub(crate) fn branch_dir(&self, branch: Branch) -> PathBuf {
        self.vault_dir().join(branch.dir_name())
    }

    /// Appends one line to the vault's `.audit` log, creating it if needed.
    pub fn audit(&self, line: &str) -> std::io::Result<()> {
        use std::io::Write;
        let path = self.vault_dir().join(".audit");
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{} {}", chrono::Utc::now().to_rfc3339(), line)
    }
}

/// Creates `path` with the setgid bit set and group ownership matching
/// `gid`, per the vault invariant that every vault/branch directory is
/// group-inherited.
fn create_setgid_dir(path: &Path, gid: u32) -> Result<(), VaultError> {
    use nix::sys::stat::Mode;
    use nix::unistd::{Gid, mkdir};

    mkdir(path, Mode::from_bits_truncate(0o2770)).or_else(|e| {
        if e == nix::errno::Errno::EEXIST { Ok(()) } else { Err(e) }
    }).map_err(|e| VaultError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;
    std::os::unix::fs::chown(path, None, Some(gid))
        .map_err(|source| VaultError::Io { path: path.to_path_buf(), source })?;
    // mkdir's mode is filtered by umask; set it explicitly so setgid sticks.
    fs::set_permissions(path, fs::Permissions::from_mode(0o2770))
        .map_err(|source| VaultError::Io { path: path.to_path_buf(), source })?;
    let _ = Gid::from_raw(gid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    /// `locate` climbs while the gid matches; to exercise that boundary the
    /// "group" directory (and everything under it) must carry a gid distinct
    /// from its parent, which in a single-process test means chowning it
    /// explicitly rather than relying on incidental process gid.
    fn distinct_gid() -> u32 {
        use std::os::unix::fs::MetadataExt;
        fs::metadata("/").unwrap().gid() + 1
    }

    #[test]
    fn locate_climbs_to_highest_homogroupic_ancestor() {
        let dir = tempdir().unwrap();
        let group = dir.path().join("group");
        let proj = group.join("project");
        fs::create_dir_all(&proj).unwrap();
        fs::create_dir_all(group.join(".vault")).unwrap();
        let gid = distinct_gid();
        std::os::unix::fs::chown(&group, None, Some(gid)).unwrap();
        std::os::unix::fs::chown(&proj, None, Some(gid)).unwrap();

        let vault = Vault::locate(&proj).unwrap();
        assert_eq!(vault.root(), group.canonicalize().unwrap());
    }

    #[test]
    fn locate_is_a_fixed_point() {
        let dir = tempdir().unwrap();
        let group = dir.path().join("group");
        let proj = group.join("project");
        fs::create_dir_all(&proj).unwrap();
        fs::create_dir_all(group.join(".vault")).unwrap();
        let gid = distinct_gid();
        std::os::unix::fs::chown(&group, None, Some(gid)).unwrap();
        std::os::unix::fs::chown(&proj, None, Some(gid)).unwrap();

        let v1 = Vault::locate(&proj).unwrap();
        let v2 = Vault::locate(v1.root()).unwrap();
        assert_eq!(v1.root(), v2.root());
    }

    #[test]
    fn locate_fails_without_a_vault() {
        let dir = tempdir().unwrap();
        let proj = dir.path().join("project");
        fs::create_dir_all(&proj).unwrap();
        assert!(Vault::locate(&proj).is_err());
    }

    #[test]
    fn locate_rejects_the_vault_dir_itself() {
        let dir = tempdir().unwrap();
        let vault_dir = dir.path().join(".vault");
        fs::create_dir_all(&vault_dir).unwrap();
        assert!(matches!(Vault::locate(&vault_dir), Err(VaultError::IsVault(_))));
    }
}
