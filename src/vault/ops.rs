//! Vault mutation and query operations: `add`, `move`, `remove`, `list`,
//! `lookup`, plus the upfront permission checks and consistency scan.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::info;

use crate::error::VaultError;
use crate::key;

use super::branch::{Branch, ListContext};
use super::Vault;

/// A consistency problem found while scanning a branch: the hardlink's link
/// count is lower than the branch's invariant allows, meaning the source (or
/// some other expected link) has vanished out from under the vault.
#[derive(Debug, Clone)]
pub struct ConsistencyIssue {
    pub branch: Branch,
    pub key_path: PathBuf,
    pub expected_min_links: u64,
    pub actual_links: u64,
}

impl Vault {
    /// O(1) lookup of an inode's branch and key, by descending directly into
    /// the directory the key codec derives from the inode alone.
    pub fn lookup(&self, inode: u64) -> Result<Option<(Branch, PathBuf)>, VaultError> {
        for branch in Branch::all() {
            if let Some(key_path) = self.lookup_in_branch(branch, inode)? {
                return Ok(Some((branch, key_path)));
            }
        }
        Ok(None)
    }

    fn lookup_in_branch(&self, branch: Branch, inode: u64) -> Result<Option<PathBuf>, VaultError> {
        let (prefix, lsb) = key::split_inode(inode);
        let search_dir = self.branch_dir(branch).join(&prefix);
        if !search_dir.is_dir() {
            return Ok(None);
        }
        let needle = format!("{lsb:02X}-");
        let entries = fs::read_dir(&search_dir)
            .map_err(|source| VaultError::Io { path: search_dir.clone(), source })?;
        for entry in entries {
            let entry = entry.map_err(|source| VaultError::Io { path: search_dir.clone(), source })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&needle) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Admits a regular file into `branch`. See §4.2 for the precondition
    /// list; each fails with a distinct, recoverable error.
    pub fn add(&self, branch: Branch, source: &Path) -> Result<(), VaultError> {
        let meta = fs::metadata(source).map_err(|source_err| VaultError::Io {
            path: source.to_path_buf(),
            source: source_err,
        })?;

        if !meta.is_file() {
            return Err(VaultError::NotRegular(source.to_path_buf()));
        }

        let mode = meta.permissions().mode();
        if mode & 0o660 != 0o660 {
            return Err(VaultError::PermissionDenied {
                path: source.to_path_buf(),
                reason: "mode is not at least ug+rw".to_string(),
            });
        }
        let user_bits = (mode >> 6) & 0o7;
        let group_bits = (mode >> 3) & 0o7;
        if user_bits != group_bits {
            return Err(VaultError::PermissionDenied {
                path: source.to_path_buf(),
                reason: "user and group permission bits differ".to_string(),
            });
        }
        let parent = source.parent().ok_or_else(|| VaultError::NotRegular(source.to_path_buf()))?;
        let parent_meta = fs::metadata(parent)
            .map_err(|source_err| VaultError::Io { path: parent.to_path_buf(), source: source_err })?;
        if parent_meta.permissions().mode() & 0o330 != 0o330 {
            return Err(VaultError::PermissionDenied {
                path: parent.to_path_buf(),
                reason: "parent directory mode is not at least ug+wx".to_string(),
            });
        }

        let inode = meta.ino();
        let name_max = key::name_max_for(&self.vault_dir());
        let relpath = source
            .canonicalize()
            .map_err(|source_err| VaultError::Io { path: source.to_path_buf(), source: source_err })?
            .strip_prefix(&self.root)
            .map_err(|_| VaultError::NotRegular(source.to_path_buf()))?
            .to_path_buf();
        let desired_key = self.ensure_branch_dir(branch)?.join(key::encode(
            inode,
            relpath.as_os_str().as_encoded_bytes(),
            name_max,
        ));

        if let Some((existing_branch, existing_key)) = self.lookup(inode)? {
            if matches!(existing_branch, Branch::Staged | Branch::Limbo) {
                return Err(VaultError::AlreadyTracked {
                    inode,
                    existing_branch: existing_branch.to_string(),
                });
            }
            if existing_key != desired_key {
                if let Some(parent) = desired_key.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|source_err| VaultError::Io { path: parent.to_path_buf(), source: source_err })?;
                }
                fs::rename(&existing_key, &desired_key)
                    .map_err(|source_err| VaultError::Io { path: existing_key.clone(), source: source_err })?;
                prune_empty_ancestors(&existing_key, &self.branch_dir(existing_branch));
                info!(
                    "corrected stale vault key for inode {inode}: {} -> {}",
                    existing_key.display(),
                    desired_key.display()
                );
                let _ = self.audit(&format!(
                    "rekey inode={inode} branch={branch} from={} to={}",
                    existing_key.display(),
                    desired_key.display()
                ));
            }
            return Ok(());
        }

        if let Some(parent) = desired_key.parent() {
            fs::create_dir_all(parent)
                .map_err(|source_err| VaultError::Io { path: parent.to_path_buf(), source: source_err })?;
        }
        fs::hard_link(source, &desired_key)
            .map_err(|source_err| VaultError::Io { path: desired_key.clone(), source: source_err })?;
        let _ = self.audit(&format!("add inode={inode} branch={branch} key={}", desired_key.display()));
        Ok(())
    }

    /// Atomically moves a tracked inode from one branch to another.
    pub fn move_branch(&self, inode: u64, from: Branch, to: Branch) -> Result<PathBuf, VaultError> {
        let old_path = self
            .lookup_in_branch(from, inode)?
            .ok_or_else(|| VaultError::NotTracked(PathBuf::from(format!("inode {inode} in {from}"))))?;
        let rel = old_path
            .strip_prefix(self.branch_dir(from))
            .expect("lookup_in_branch returns a path under the branch dir")
            .to_path_buf();
        let new_path = self.ensure_branch_dir(to)?.join(&rel);
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| VaultError::Io { path: parent.to_path_buf(), source })?;
        }
        fs::rename(&old_path, &new_path)
            .map_err(|source| VaultError::Io { path: old_path.clone(), source })?;
        prune_empty_ancestors(&old_path, &self.branch_dir(from));
        let _ = self.audit(&format!("move inode={inode} {from} -> {to}"));
        Ok(new_path)
    }

    /// Unlinks a tracked inode's hardlink from `branch`, pruning now-empty
    /// ancestor directories back to the branch root.
    pub fn remove(&self, branch: Branch, inode: u64) -> Result<(), VaultError> {
        let key_path = self
            .lookup_in_branch(branch, inode)?
            .ok_or_else(|| VaultError::NotTracked(PathBuf::from(format!("inode {inode} in {branch}"))))?;
        fs::remove_file(&key_path).map_err(|source| VaultError::Io { path: key_path.clone(), source })?;
        prune_empty_ancestors(&key_path, &self.branch_dir(branch));
        let _ = self.audit(&format!("remove inode={inode} branch={branch} key={}", key_path.display()));
        Ok(())
    }

    /// Enumerates the (inode, original relative path) pairs tracked in a
    /// branch, filtered by `context`.
    pub fn list(
        &self,
        branch: Branch,
        context: ListContext,
        caller_uid: u32,
        caller_cwd_relative: Option<&Path>,
    ) -> Result<Vec<(u64, PathBuf)>, VaultError> {
        let branch_dir = self.branch_dir(branch);
        if !branch_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut leaves = Vec::new();
        collect_leaf_files(&branch_dir, &mut leaves)?;
        for leaf in leaves {
            let rel_key = leaf
                .strip_prefix(&branch_dir)
                .expect("collected under branch_dir")
                .to_path_buf();
            let (inode, relpath_bytes) = match key::decode(&rel_key) {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let relpath = PathBuf::from(std::ffi::OsStr::new(
                std::str::from_utf8(&relpath_bytes).unwrap_or_default(),
            ));

            let include = match context {
                ListContext::All => true,
                ListContext::Here => caller_cwd_relative
                    .map(|cwd| relpath.starts_with(cwd))
                    .unwrap_or(true),
                ListContext::Mine => fs::metadata(&leaf).map(|m| m.uid() == caller_uid).unwrap_or(false),
            };
            if include {
                out.push((inode, relpath));
            }
        }
        Ok(out)
    }

    /// Scans a branch for hardlinks whose link count violates the branch's
    /// minimum, which signals the source (or another expected link) vanished
    /// out from under the vault.
    pub fn check_consistency(&self, branch: Branch) -> Result<Vec<ConsistencyIssue>, VaultError> {
        let branch_dir = self.branch_dir(branch);
        if !branch_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut leaves = Vec::new();
        collect_leaf_files(&branch_dir, &mut leaves)?;
        let mut issues = Vec::new();
        for leaf in leaves {
            let meta = fs::metadata(&leaf).map_err(|source| VaultError::Io { path: leaf.clone(), source })?;
            let min = branch.min_link_count();
            if meta.nlink() < min {
                issues.push(ConsistencyIssue {
                    branch,
                    key_path: leaf,
                    expected_min_links: min,
                    actual_links: meta.nlink(),
                });
            }
        }
        Ok(issues)
    }
}

fn collect_leaf_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), VaultError> {
    let entries = fs::read_dir(dir).map_err(|source| VaultError::Io { path: dir.to_path_buf(), source })?;
    for entry in entries {
        let entry = entry.map_err(|source| VaultError::Io { path: dir.to_path_buf(), source })?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|source| VaultError::Io { path: path.clone(), source })?;
        if file_type.is_dir() {
            collect_leaf_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Removes now-empty directories from `path`'s parent up to (but not
/// including) `stop_at`.
fn prune_empty_ancestors(path: &Path, stop_at: &Path) {
    let mut cursor = path.parent();
    while let Some(dir) = cursor {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        let is_empty = match fs::read_dir(dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => break,
        };
        if !is_empty || fs::remove_dir(dir).is_err() {
            break;
        }
        cursor = dir.parent();
    }
}
