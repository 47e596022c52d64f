//! `vault`: the interactive per-user CLI for keeping, archiving, recovering,
//! and untracking files (§6).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use vault::vault::{Branch, ListContext, Vault};

const MAX_FILES_PER_INVOCATION: usize = 10;

#[derive(Parser)]
#[command(name = "vault", about = "Hardlink-based retention vault")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Annotate files into the `keep` branch.
    Keep {
        #[arg(long)]
        view: Option<Option<String>>,
        #[arg(long)]
        absolute: bool,
        #[arg(long)]
        fofn: Option<PathBuf>,
        files: Vec<PathBuf>,
    },
    /// Annotate files into the `archive` (or `--stash`) branch.
    Archive {
        #[arg(long)]
        stash: bool,
        #[arg(long)]
        view: Option<Option<String>>,
        #[arg(long)]
        view_staged: Option<Option<String>>,
        #[arg(long)]
        absolute: bool,
        #[arg(long)]
        fofn: Option<PathBuf>,
        files: Vec<PathBuf>,
    },
    /// Restore files from `limbo` to their original source path.
    Recover {
        #[arg(long)]
        view: Option<Option<String>>,
        #[arg(long)]
        absolute: bool,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        fofn: Option<PathBuf>,
        files: Vec<PathBuf>,
    },
    /// Remove files from whichever of keep/archive/stash they live in.
    Untrack {
        #[arg(long)]
        fofn: Option<PathBuf>,
        files: Vec<PathBuf>,
    },
}

/// Resolves the effective file list for a command: positional `FILE…`
/// arguments plus, if given, one path per line from `--fofn PATH`.
fn resolve_files(files: Vec<PathBuf>, fofn: Option<PathBuf>) -> Result<Vec<PathBuf>, ExitCode> {
    let mut out = files;
    if let Some(path) = fofn {
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            eprintln!("vault: --fofn {}: {e}", path.display());
            ExitCode::from(2)
        })?;
        out.extend(contents.lines().filter(|l| !l.is_empty()).map(PathBuf::from));
    }
    Ok(out)
}

fn parse_context(raw: &Option<String>) -> ListContext {
    match raw.as_deref() {
        Some("mine") => ListContext::Mine,
        Some("here") | None => ListContext::Here,
        Some(_) => ListContext::All,
    }
}

fn print_listing(vault: &Vault, branch: Branch, ctx: ListContext, absolute: bool) -> Result<(), vault::error::VaultError> {
    let caller_uid = nix::unistd::getuid().as_raw();
    let cwd = std::env::current_dir().ok();
    let cwd_relative = cwd.as_deref().and_then(|c| c.strip_prefix(vault.root()).ok()).map(Path::to_path_buf);
    let entries = vault.list(branch, ctx, caller_uid, cwd_relative.as_deref())?;
    for (inode, relpath) in entries {
        if absolute {
            println!("{}", vault.root().join(&relpath).display());
        } else {
            println!("{} {}", inode, relpath.display());
        }
    }
    Ok(())
}

fn run_add(branch: Branch, files: &[PathBuf]) -> ExitCode {
    if files.len() > MAX_FILES_PER_INVOCATION {
        eprintln!("vault: at most {MAX_FILES_PER_INVOCATION} files per invocation");
        return ExitCode::from(2);
    }
    if files.is_empty() {
        eprintln!("vault: no files given");
        return ExitCode::from(2);
    }

    let mut failures = 0;
    for file in files {
        let vault = match Vault::locate(file) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("vault: {}: {e}", file.display());
                return ExitCode::from(3);
            }
        };
        if let Err(e) = vault.add(branch, file) {
            eprintln!("vault: {}: {e}", file.display());
            failures += 1;
        }
    }
    if failures > 0 { ExitCode::from(1) } else { ExitCode::SUCCESS }
}

fn run_recover(files: &[PathBuf], all: bool) -> ExitCode {
    let reference = files.first().cloned().or_else(|| std::env::current_dir().ok());
    let Some(reference) = reference else {
        eprintln!("vault: cannot determine vault (no files given, no cwd)");
        return ExitCode::from(2);
    };
    let vault = match Vault::locate(&reference) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("vault: {e}");
            return ExitCode::from(3);
        }
    };

    let targets: Vec<(u64, PathBuf)> = if all {
        match vault.list(Branch::Limbo, ListContext::All, nix::unistd::getuid().as_raw(), None) {
            Ok(entries) => entries,
            Err(e) => {
                eprintln!("vault: {e}");
                return ExitCode::from(1);
            }
        }
    } else {
        let mut out = Vec::new();
        for file in files {
            let Ok(meta) = std::fs::metadata(file) else {
                eprintln!("vault: {}: not found", file.display());
                continue;
            };
            use std::os::unix::fs::MetadataExt;
            out.push((meta.ino(), file.clone()));
        }
        out
    };

    let mut failures = 0;
    for (inode, relpath) in targets {
        let dest = vault.root().join(&relpath);
        if dest.exists() {
            eprintln!("vault: {}: source already exists, refusing to overwrite", dest.display());
            failures += 1;
            continue;
        }
        if let Some((_, limbo_key)) = vault.lookup(inode).unwrap_or(None) {
            if let Err(e) = std::fs::hard_link(&limbo_key, &dest) {
                eprintln!("vault: {}: {e}", dest.display());
                failures += 1;
                continue;
            }
            let now = filetime::FileTime::now();
            let _ = filetime::set_file_mtime(&dest, now);
            let _ = vault.remove(Branch::Limbo, inode);
        } else {
            eprintln!("vault: inode {inode} not found in limbo");
            failures += 1;
        }
    }
    if failures > 0 { ExitCode::from(1) } else { ExitCode::SUCCESS }
}

fn run_untrack(files: &[PathBuf]) -> ExitCode {
    let mut failures = 0;
    for file in files {
        let vault = match Vault::locate(file) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("vault: {}: {e}", file.display());
                failures += 1;
                continue;
            }
        };
        let Ok(meta) = std::fs::metadata(file) else {
            eprintln!("vault: {}: not found", file.display());
            failures += 1;
            continue;
        };
        use std::os::unix::fs::MetadataExt;
        let inode = meta.ino();

        let removed = [Branch::Keep, Branch::Archive, Branch::Stash]
            .into_iter()
            .find_map(|branch| vault.remove(branch, inode).ok().map(|_| branch));
        if removed.is_none() {
            eprintln!("vault: {}: not tracked in keep/archive/stash", file.display());
            failures += 1;
        }
    }
    if failures > 0 { ExitCode::from(1) } else { ExitCode::SUCCESS }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Keep { view, absolute, fofn, files } => {
            if let Some(ctx) = view {
                let reference = files.first().cloned().or_else(|| std::env::current_dir().ok());
                let vault = match reference.ok_or(()).and_then(|r| Vault::locate(&r).map_err(|_| ())) {
                    Ok(v) => v,
                    Err(_) => {
                        eprintln!("vault: no vault for current directory");
                        return ExitCode::from(3);
                    }
                };
                if let Err(e) = print_listing(&vault, Branch::Keep, parse_context(&ctx), absolute) {
                    eprintln!("vault: {e}");
                    return ExitCode::from(1);
                }
                return ExitCode::SUCCESS;
            }
            let files = match resolve_files(files, fofn) {
                Ok(f) => f,
                Err(code) => return code,
            };
            run_add(Branch::Keep, &files)
        }
        Command::Archive { stash, view, view_staged, absolute, fofn, files } => {
            let branch = if stash { Branch::Stash } else { Branch::Archive };
            if let Some(ctx) = view.or(view_staged.clone()) {
                let target_branch = if view_staged.is_some() { Branch::Staged } else { branch };
                let vault = match std::env::current_dir().ok().and_then(|cwd| Vault::locate(&cwd).ok()) {
                    Some(v) => v,
                    None => {
                        eprintln!("vault: no vault for current directory");
                        return ExitCode::from(3);
                    }
                };
                if let Err(e) = print_listing(&vault, target_branch, parse_context(&ctx), absolute) {
                    eprintln!("vault: {e}");
                    return ExitCode::from(1);
                }
                return ExitCode::SUCCESS;
            }
            let files = match resolve_files(files, fofn) {
                Ok(f) => f,
                Err(code) => return code,
            };
            run_add(branch, &files)
        }
        Command::Recover { view, absolute, all, fofn, files } => {
            if let Some(ctx) = view {
                let vault = match std::env::current_dir().ok().and_then(|cwd| Vault::locate(&cwd).ok()) {
                    Some(v) => v,
                    None => {
                        eprintln!("vault: no vault for current directory");
                        return ExitCode::from(3);
                    }
                };
                if let Err(e) = print_listing(&vault, Branch::Limbo, parse_context(&ctx), absolute) {
                    eprintln!("vault: {e}");
                    return ExitCode::from(1);
                }
                return ExitCode::SUCCESS;
            }
            let files = match resolve_files(files, fofn) {
                Ok(f) => f,
                Err(code) => return code,
            };
            run_recover(&files, all)
        }
        Command::Untrack { fofn, files } => {
            let files = match resolve_files(files, fofn) {
                Ok(f) => f,
                Err(code) => return code,
            };
            run_untrack(&files)
        }
    }
}
