//! Notifier: per-stakeholder aggregation of a sweep's warnings, soft
//! deletions, and staged archivals into one e-mail each, with gzip FOFN
//! attachments.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::error::MailError;
use crate::mail::{Attachment, Envelope, MailTransport};

/// The files due within a single warning checkpoint, for one stakeholder.
#[derive(Debug, Clone, Default)]
pub struct WarningBucket {
    pub tminus_hours: u32,
    pub files: Vec<PathBuf>,
}

/// Everything accumulated for one uid across a sweep.
#[derive(Debug, Clone, Default)]
pub struct StakeholderPayload {
    pub uid: u32,
    pub email: String,
    pub warnings: Vec<WarningBucket>,
    pub deleted: Vec<PathBuf>,
    pub staged: Vec<PathBuf>,
}

impl StakeholderPayload {
    pub fn new(uid: u32, email: String) -> Self {
        Self { uid, email, ..Default::default() }
    }

    /// Removes `path` from every pending-warning bucket. The sweeper calls
    /// this the moment a file transitions to `deleted` within the same pass,
    /// so a file never appears simultaneously in a warning list and the
    /// deleted list (§4.6's resolved policy).
    pub fn retract_warnings_for(&mut self, path: &PathBuf) {
        for bucket in &mut self.warnings {
            bucket.files.retain(|f| f != path);
        }
    }

    fn is_empty(&self) -> bool {
        self.warnings.iter().all(|b| b.files.is_empty()) && self.deleted.is_empty() && self.staged.is_empty()
    }
}

fn gzip_fofn(paths: &[PathBuf]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for path in paths {
        encoder.write_all(path.as_os_str().as_encoded_bytes())?;
        encoder.write_all(b"\0")?;
    }
    encoder.finish()
}

/// Groups files by a common directory prefix for the body summary: returns
/// (prefix, file count, total bytes) tuples, one per directory-of-group.
pub fn summarize_by_prefix(paths: &[(PathBuf, u64)]) -> Vec<(PathBuf, usize, u64)> {
    let mut groups: BTreeMap<PathBuf, (usize, u64)> = BTreeMap::new();
    for (path, size) in paths {
        let prefix = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let entry = groups.entry(prefix).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += size;
    }
    groups.into_iter().map(|(prefix, (count, bytes))| (prefix, count, bytes)).collect()
}

/// Builds and sends exactly one e-mail per stakeholder with a non-empty
/// payload. Future tense for pending reclamation; never the word
/// "IRRECOVERABLY" for soft-deletions, since limbo is still recoverable.
pub async fn notify(transport: &dyn MailTransport, payloads: Vec<StakeholderPayload>) -> Result<Vec<u32>, MailError> {
    let mut notified = Vec::new();
    for payload in payloads {
        if payload.is_empty() {
            continue;
        }
        let mut attachments = Vec::new();
        let mut body = String::new();

        for bucket in &payload.warnings {
            if bucket.files.is_empty() {
                continue;
            }
            body.push_str(&format!(
                "{} file(s) will be reclaimed within {} hours unless acted on.\n",
                bucket.files.len(),
                bucket.tminus_hours
            ));
            let gz = gzip_fofn(&bucket.files).map_err(|e| MailError::Transport(e.to_string()))?;
            attachments.push(Attachment { filename: format!("delete-{}.fofn.gz", bucket.tminus_hours), gzip_bytes: gz });
        }

        if !payload.deleted.is_empty() {
            body.push_str(&format!(
                "{} file(s) have been moved to recoverable storage this run.\n",
                payload.deleted.len()
            ));
            let gz = gzip_fofn(&payload.deleted).map_err(|e| MailError::Transport(e.to_string()))?;
            attachments.push(Attachment { filename: "deleted.fofn.gz".to_string(), gzip_bytes: gz });
        }

        if !payload.staged.is_empty() {
            body.push_str(&format!("{} file(s) have been staged for archival.\n", payload.staged.len()));
            let gz = gzip_fofn(&payload.staged).map_err(|e| MailError::Transport(e.to_string()))?;
            attachments.push(Attachment { filename: "staged.fofn.gz".to_string(), gzip_bytes: gz });
        }

        transport
            .send(Envelope {
                to: payload.email.clone(),
                subject: "Vault retention notice".to_string(),
                body,
                attachments,
            })
            .await?;
        notified.push(payload.uid);
    }
    Ok(notified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::RecordingMailTransport;

    #[tokio::test]
    async fn sends_one_email_per_nonempty_stakeholder() {
        let mut payload = StakeholderPayload::new(1000, "alice@example.com".to_string());
        payload.warnings.push(WarningBucket { tminus_hours: 24, files: vec![PathBuf::from("/a/b.txt")] });
        let empty_payload = StakeholderPayload::new(1001, "bob@example.com".to_string());

        let transport = RecordingMailTransport::new();
        let notified = notify(&transport, vec![payload, empty_payload]).await.unwrap();

        assert_eq!(notified, vec![1000]);
        assert_eq!(transport.sent().len(), 1);
        assert!(!transport.sent()[0].body.to_uppercase().contains("IRRECOVERABLY"));
    }

    #[test]
    fn retracting_a_warning_removes_it_from_every_bucket() {
        let mut payload = StakeholderPayload::new(1000, "alice@example.com".to_string());
        let path = PathBuf::from("/a/b.txt");
        payload.warnings.push(WarningBucket { tminus_hours: 24, files: vec![path.clone()] });
        payload.warnings.push(WarningBucket { tminus_hours: 168, files: vec![path.clone()] });
        payload.retract_warnings_for(&path);
        assert!(payload.warnings.iter().all(|b| b.files.is_empty()));
    }
}
