//! Layered configuration, loaded from `$VAULTRC` > `~/.vaultrc` > `/etc/vaultrc`.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level configuration, deserialized from whichever vaultrc file wins.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    pub persistence: PersistenceConfig,
    pub email: EmailConfig,
    pub deletion: DeletionConfig,
    pub archive: ArchiveConfig,
    #[serde(default = "default_min_group_owners")]
    pub min_group_owners: u32,
    #[serde(default = "default_run_interval")]
    pub sandman_run_interval: u32,
}

fn default_min_group_owners() -> u32 {
    1
}

fn default_run_interval() -> u32 {
    24
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    pub ldap: Option<LdapConfig>,
    #[serde(default)]
    pub static_directory: Vec<StaticIdentityEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticIdentityEntry {
    pub uid: u32,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapConfig {
    pub host: String,
    pub port: u16,
    pub base_dn: String,
    #[serde(default = "default_attr_uid")]
    pub attr_uid: String,
    #[serde(default = "default_attr_name")]
    pub attr_name: String,
    #[serde(default = "default_attr_email")]
    pub attr_email: String,
    #[serde(default = "default_attr_gid")]
    pub attr_gid: String,
    #[serde(default = "default_attr_owners")]
    pub attr_owners: String,
    #[serde(default = "default_attr_members")]
    pub attr_members: String,
}

fn default_attr_uid() -> String {
    "uid".to_string()
}
fn default_attr_name() -> String {
    "cn".to_string()
}
fn default_attr_email() -> String {
    "mail".to_string()
}
fn default_attr_gid() -> String {
    "gidNumber".to_string()
}
fn default_attr_owners() -> String {
    "owner".to_string()
}
fn default_attr_members() -> String {
    "memberUid".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

fn default_pg_port() -> u16 {
    5432
}

impl PostgresConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp: SmtpConfig,
    pub sender: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeletionConfig {
    pub threshold: u32,
    pub limbo: u32,
    pub warnings: Vec<u32>,
    pub keep: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    pub threshold: u32,
    pub handler: PathBuf,
}

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no vaultrc file found ($VAULTRC, ~/.vaultrc, /etc/vaultrc)")]
    NotFound,
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("deletion.warnings entries must not exceed 2160 hours, found {0}")]
    WarningCheckpointTooLarge(u32),
}

impl Config {
    /// Locates and loads the vaultrc file per the documented precedence, then
    /// validates the hard constraints the loader itself (not serde) enforces.
    pub fn load() -> Result<Config, ConfigError> {
        let path = Self::resolve_path().ok_or(ConfigError::NotFound)?;
        Self::load_from(&path)
    }

    /// Loads and validates configuration from an explicit path (used by tests
    /// and by callers that already resolved `$VAULTRC`).
    pub fn load_from(path: &std::path::Path) -> Result<Config, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("VAULT").separator("__"))
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(&too_large) = self.deletion.warnings.iter().find(|&&h| h > 2160) {
            return Err(ConfigError::WarningCheckpointTooLarge(too_large));
        }
        Ok(())
    }

    fn resolve_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("VAULTRC") {
            return Some(PathBuf::from(path));
        }
        if let Some(home) = std::env::var_os("HOME") {
            let candidate = PathBuf::from(home).join(".vaultrc");
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        let etc = PathBuf::from("/etc/vaultrc");
        if etc.is_file() {
            return Some(etc);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_minimal(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("vaultrc.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
            [persistence.postgres]
            host = "localhost"
            database = "vault"
            user = "vault"
            password = "secret"

            [email]
            sender = "vault@example.com"

            [email.smtp]
            host = "localhost"

            [deletion]
            threshold = 90
            limbo = 14
            warnings = [24, 168]

            [archive]
            threshold = 100
            handler = "/usr/local/bin/archive-handler"
            "#
        )
        .unwrap();
        path
    }

    #[test]
    fn loads_a_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_minimal(&dir);
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.deletion.threshold, 90);
        assert_eq!(cfg.min_group_owners, 1);
        assert_eq!(cfg.sandman_run_interval, 24);
    }

    #[test]
    fn rejects_warning_checkpoints_beyond_90_days() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaultrc.toml");
        std::fs::write(
            &path,
            r#"
            [persistence.postgres]
            host = "localhost"
            database = "vault"
            user = "vault"
            password = "secret"

            [email]
            sender = "vault@example.com"

            [email.smtp]
            host = "localhost"

            [deletion]
            threshold = 90
            limbo = 14
            warnings = [2200]

            [archive]
            threshold = 100
            handler = "/usr/local/bin/archive-handler"
            "#,
        )
        .unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::WarningCheckpointTooLarge(2200))
        ));
    }
}
