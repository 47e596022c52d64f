//! `sandman`: runs a sweep then a drain across the given roots (§6).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use vault::config::Config;
use vault::consensus::ConsensusGate;
use vault::drainer;
use vault::identity::StaticIdentityDirectory;
use vault::mail::{MailTransport, RecordingMailTransport, SmtpMailTransport};
use vault::persistence::Persistence;
use vault::sweeper::{self, SweepContext};
use vault::walker::Walker;

#[derive(Parser)]
#[command(name = "sandman", about = "Runs a sweep and drain over the given vault-covered roots")]
struct Cli {
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    force_drain: bool,
    /// Consumes a pre-computed stat listing instead of walking the
    /// filesystem live (§4.3/§6): one record per line,
    /// `path\tdevice\tinode\towner_uid\tgroup_gid\tsize\tmtime_epoch\tnlink`.
    #[arg(long)]
    stats: Option<PathBuf>,
    dirs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.stats.is_none() && cli.dirs.is_empty() {
        eprintln!("sandman: at least one directory is required");
        return ExitCode::from(2);
    }

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sandman: {e}");
            return ExitCode::from(2);
        }
    };

    let persistence = match Persistence::connect(&config.persistence.postgres.connection_string()).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("sandman: could not connect to persistence backend: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = persistence.migrate().await {
        eprintln!("sandman: migration failed: {e}");
        return ExitCode::from(1);
    }

    let identities = StaticIdentityDirectory::new();
    let recording_transport;
    let smtp_transport;
    let mail: &dyn MailTransport = if cli.dry_run {
        recording_transport = RecordingMailTransport::new();
        &recording_transport
    } else {
        match SmtpMailTransport::new(&config.email.smtp, config.email.sender.clone()) {
            Ok(t) => {
                smtp_transport = t;
                &smtp_transport
            }
            Err(e) => {
                eprintln!("sandman: could not initialize mail transport: {e}");
                return ExitCode::from(1);
            }
        }
    };

    let consensus = ConsensusGate::default();
    let entries = if let Some(stats_path) = &cli.stats {
        match Walker::from_stat_listing(stats_path) {
            Ok(e) => e,
            Err(e) => {
                eprintln!("sandman: could not read stat listing {}: {e}", stats_path.display());
                return ExitCode::from(2);
            }
        }
    } else {
        let mut walker = Walker::new(cli.dirs.clone());
        let entries = match walker.walk() {
            Ok(e) => e,
            Err(e) => {
                eprintln!("sandman: walk failed: {e}");
                return ExitCode::from(1);
            }
        };
        for skipped in walker.skipped() {
            log::warn!("no vault covers {}: skipped", skipped.display());
        }
        entries
    };

    let ctx = SweepContext {
        persistence: &persistence,
        identities: &identities,
        mail,
        consensus: &consensus,
        deletion: &config.deletion,
        dry_run: cli.dry_run,
    };

    let report = match sweeper::sweep(entries, &ctx, std::time::SystemTime::now()).await {
        Ok(r) => r,
        Err(e) => {
            log::error!("sweep aborted: {e}");
            return ExitCode::from(1);
        }
    };

    log::info!(
        "sweep summary: warned={} soft_deleted={} staged={} untracked_from_keep={} limbo_purged={} skipped={} notified={}",
        report.warned,
        report.soft_deleted,
        report.staged,
        report.untracked_from_keep,
        report.limbo_purged,
        report.skipped.len(),
        report.notified_uids.len(),
    );

    if let Err(e) = sweeper::run_purge(&persistence, chrono::Utc::now()).await {
        log::error!("purge step failed: {e}");
    }

    let backlog_count = match persistence.staged_backlog().await {
        Ok(b) => b.len(),
        Err(_) => 0,
    };
    let should_drain = (cli.force_drain || backlog_count >= config.archive.threshold as usize) && !cli.dry_run;
    if should_drain {
        match drainer::drain(&persistence, &config.archive.handler).await {
            Ok(n) => log::info!("drained {n} staged entries"),
            Err(e) => log::warn!("drain did not complete: {e}"),
        }
    }

    if !report.skipped.is_empty() { ExitCode::from(1) } else { ExitCode::SUCCESS }
}
