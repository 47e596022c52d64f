//! Drainer: probes the downstream archival handler, then streams the staged
//! backlog to it over a NUL-delimited stdin protocol (§4.7).

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::DrainError;
use crate::persistence::Persistence;

/// Result of probing the handler's readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Busy,
    NoCapacity,
}

/// Probes the handler with `ready [<bytes-required>]`. Exit 0 = ready, 1 =
/// busy, 2 = insufficient capacity, anything else is a hard failure.
pub async fn probe(handler: &Path, bytes_required: u64) -> Result<Readiness, DrainError> {
    let mut cmd = Command::new(handler);
    cmd.arg("ready");
    if bytes_required > 0 {
        cmd.arg(bytes_required.to_string());
    }
    let status = cmd.stdout(Stdio::null()).status().await?;
    match status.code() {
        Some(0) => Ok(Readiness::Ready),
        Some(1) => Ok(Readiness::Busy),
        Some(2) => Ok(Readiness::NoCapacity),
        other => Err(DrainError::HandlerFailed(format!("probe exited with {other:?}"))),
    }
}

/// Runs a single drain pass: probes readiness, and if ready, streams the
/// entire staged backlog to the handler. Leaves the backlog intact on any
/// handler failure (including non-zero handler exit).
pub async fn drain(persistence: &Persistence, handler: &Path) -> Result<usize, DrainError> {
    let total_bytes = persistence.staged_backlog_total_bytes().await? as u64;

    match probe(handler, total_bytes).await? {
        Readiness::Ready => {}
        Readiness::Busy => return Err(DrainError::HandlerBusy),
        Readiness::NoCapacity => return Err(DrainError::HandlerNoCapacity),
    }

    let backlog = persistence.staged_backlog().await?;
    if backlog.is_empty() {
        return Ok(0);
    }

    let mut child = Command::new(handler)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()?;
    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        for (_, path) in &backlog {
            stdin.write_all(path.as_bytes()).await?;
            stdin.write_all(b"\0").await?;
        }
        stdin.shutdown().await?;
    }
    let status = child.wait().await?;

    if !status.success() {
        return Err(DrainError::HandlerFailed(format!("handler exited with {status:?}")));
    }

    for (status_id, _) in &backlog {
        persistence.retire_staged(*status_id).await?;
    }
    Ok(backlog.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[cfg(unix)]
    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn probe_maps_exit_codes_to_readiness() {
        let dir = tempdir().unwrap();
        let ready = write_script(&dir, "ready.sh", "exit 0");
        let busy = write_script(&dir, "busy.sh", "exit 1");
        let no_cap = write_script(&dir, "nocap.sh", "exit 2");

        assert_eq!(probe(&ready, 0).await.unwrap(), Readiness::Ready);
        assert_eq!(probe(&busy, 0).await.unwrap(), Readiness::Busy);
        assert_eq!(probe(&no_cap, 0).await.unwrap(), Readiness::NoCapacity);
    }
}
