//! Walker: a lazy, finite traversal over a set of roots, classifying every
//! regular file it sees by the vault branch that contains it (or `outside`).

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::vault::{Branch, Vault};

/// Where in the vault lifecycle a walked file sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStatus {
    Outside,
    Keep,
    Archive,
    Stash,
    Staged,
    Limbo,
}

impl From<Branch> for WalkStatus {
    fn from(branch: Branch) -> Self {
        match branch {
            Branch::Keep => WalkStatus::Keep,
            Branch::Archive => WalkStatus::Archive,
            Branch::Stash => WalkStatus::Stash,
            Branch::Staged => WalkStatus::Staged,
            Branch::Limbo => WalkStatus::Limbo,
        }
    }
}

/// The attributes the sweeper needs about a walked file.
#[derive(Debug, Clone)]
pub struct FileAttrs {
    pub path: PathBuf,
    pub device: u64,
    pub inode: u64,
    pub owner_uid: u32,
    pub group_gid: u32,
    pub size_bytes: u64,
    pub mtime: SystemTime,
    pub nlink: u64,
}

/// One entry yielded by the walk.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub vault: Vault,
    pub attrs: FileAttrs,
    pub status: WalkStatus,
}

/// Walks a set of roots, yielding a `WalkEntry` for every regular file found
/// under a vault-covered root. Files under a root with no enclosing vault are
/// skipped (and the caller should log them; the walker itself only reports
/// them via [`Walker::skipped`]).
pub struct Walker {
    roots: Vec<PathBuf>,
    skipped: Vec<PathBuf>,
}

impl Walker {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots, skipped: Vec::new() }
    }

    /// Paths skipped so far because no vault covers them.
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    /// Runs the walk eagerly, collecting every entry. Roots are walked
    /// independently; callers wanting concurrency should fan this out
    /// per-root themselves (the sweeper does, via `tokio::task::JoinSet`).
    pub fn walk(&mut self) -> std::io::Result<Vec<WalkEntry>> {
        let mut out = Vec::new();
        let roots = self.roots.clone();
        for root in &roots {
            let vault = match Vault::locate(root) {
                Ok(v) => v,
                Err(_) => {
                    self.skipped.push(root.clone());
                    continue;
                }
            };
            self.walk_dir(root, &vault, &mut out)?;
        }
        Ok(out)
    }

    /// Alternative input: an externally supplied stat-listing file, one
    /// record per line: `path\tdevice\tinode\towner_uid\tgroup_gid\tsize\tmtime_epoch\tnlink`.
    pub fn from_stat_listing(path: &Path) -> std::io::Result<Vec<WalkEntry>> {
        let contents = fs::read_to_string(path)?;
        let mut out = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 8 {
                continue;
            }
            let file_path = PathBuf::from(fields[0]);
            let Ok(vault) = Vault::locate(&file_path) else { continue };
            let attrs = FileAttrs {
                path: file_path.clone(),
                device: fields[1].parse().unwrap_or(0),
                inode: fields[2].parse().unwrap_or(0),
                owner_uid: fields[3].parse().unwrap_or(0),
                group_gid: fields[4].parse().unwrap_or(0),
                size_bytes: fields[5].parse().unwrap_or(0),
                mtime: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(fields[6].parse().unwrap_or(0)),
                nlink: fields[7].parse().unwrap_or(1),
            };
            let status = classify(&vault, &file_path);
            out.push(WalkEntry { vault, attrs, status });
        }
        Ok(out)
    }

    fn walk_dir(&mut self, dir: &Path, vault: &Vault, out: &mut Vec<WalkEntry>) -> std::io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.walk_dir(&path, vault, out)?;
            } else if file_type.is_file() {
                let meta = fs::metadata(&path)?;
                let status = classify(vault, &path);
                out.push(WalkEntry {
                    vault: vault.clone(),
                    attrs: FileAttrs {
                        path,
                        device: meta.dev(),
                        inode: meta.ino(),
                        owner_uid: meta.uid(),
                        group_gid: meta.gid(),
                        size_bytes: meta.size(),
                        mtime: meta.modified()?,
                        nlink: meta.nlink(),
                    },
                    status,
                });
            }
        }
        Ok(())
    }
}

/// Classifies `path` as outside the vault, or within a specific branch, by
/// checking whether it descends from one of the vault's branch directories.
fn classify(vault: &Vault, path: &Path) -> WalkStatus {
    for branch in Branch::all() {
        if path.starts_with(vault.vault_dir().join(branch.dir_name())) {
            return branch.into();
        }
    }
    WalkStatus::Outside
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn make_vault_tree() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".vault/keep")).unwrap();
        fs::write(dir.path().join("plain.txt"), b"hi").unwrap();
        fs::write(dir.path().join(".vault/keep/somekey"), b"hi").unwrap();
        // `Vault::locate` climbs while the gid matches; give this root a gid
        // distinct from its parent so the climb actually stops here.
        use std::os::unix::fs::MetadataExt;
        let gid = fs::metadata("/").unwrap().gid() + 1;
        std::os::unix::fs::chown(dir.path(), None, Some(gid)).unwrap();
        dir
    }

    #[test]
    fn classifies_outside_and_keep() {
        let dir = make_vault_tree();
        let mut walker = Walker::new(vec![dir.path().to_path_buf()]);
        let entries = walker.walk().unwrap();
        let statuses: Vec<_> = entries.iter().map(|e| e.status).collect();
        assert!(statuses.contains(&WalkStatus::Outside));
        assert!(statuses.contains(&WalkStatus::Keep));
    }

    #[test]
    fn skips_roots_without_a_vault() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), b"hi").unwrap();
        let mut walker = Walker::new(vec![dir.path().to_path_buf()]);
        let entries = walker.walk().unwrap();
        assert!(entries.is_empty());
        assert_eq!(walker.skipped().len(), 1);
    }
}
