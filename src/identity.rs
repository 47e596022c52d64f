//! Identity Directory: the sweeper's view of uids, emails, and group
//! ownership, kept behind a trait so the production LDAP backend and the
//! tests' static map are interchangeable.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::IdentityError;

/// A resolved owner identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub name: String,
    pub email: String,
}

/// Stated interface to the organization's identity backend (LDAP in
/// production). All methods are async since real implementations make
/// network calls.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn resolve_owner(&self, uid: u32) -> Result<Identity, IdentityError>;
    async fn group_owners(&self, gid: u32) -> Result<Vec<u32>, IdentityError>;
    async fn min_group_owners_satisfied(&self, gid: u32, min: u32) -> Result<bool, IdentityError> {
        Ok(self.group_owners(gid).await?.len() as u32 >= min)
    }
}

/// In-memory identity directory: the config-file fallback, and what tests use.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityDirectory {
    identities: HashMap<u32, Identity>,
    group_owners: HashMap<u32, Vec<u32>>,
}

impl StaticIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identities.insert(identity.uid, identity);
        self
    }

    pub fn with_group_owners(mut self, gid: u32, owners: Vec<u32>) -> Self {
        self.group_owners.insert(gid, owners);
        self
    }
}

#[async_trait]
impl IdentityDirectory for StaticIdentityDirectory {
    async fn resolve_owner(&self, uid: u32) -> Result<Identity, IdentityError> {
        self.identities.get(&uid).cloned().ok_or(IdentityError::NoSuchIdentity(uid))
    }

    async fn group_owners(&self, gid: u32) -> Result<Vec<u32>, IdentityError> {
        Ok(self.group_owners.get(&gid).cloned().unwrap_or_default())
    }
}

#[cfg(feature = "ldap")]
pub mod ldap {
    //! LDAP-backed identity directory, enabled by the `ldap` feature.

    use super::*;
    use crate::config::LdapConfig;
    use ldap3::{LdapConnAsync, Scope, SearchEntry};

    /// Resolves identities and group ownership against an LDAP directory
    /// using the attribute mapping from `identity.ldap.*` config keys.
    pub struct LdapIdentityDirectory {
        url: String,
        config: LdapConfig,
    }

    impl LdapIdentityDirectory {
        pub fn new(config: LdapConfig) -> Self {
            let url = format!("ldap://{}:{}", config.host, config.port);
            Self { url, config }
        }

        async fn connect(&self) -> Result<ldap3::Ldap, IdentityError> {
            let (conn, ldap) = LdapConnAsync::new(&self.url)
                .await
                .map_err(|e| IdentityError::Backend(e.to_string()))?;
            ldap3::drive!(conn);
            Ok(ldap)
        }
    }

    #[async_trait]
    impl IdentityDirectory for LdapIdentityDirectory {
        async fn resolve_owner(&self, uid: u32) -> Result<Identity, IdentityError> {
            let mut ldap = self.connect().await?;
            let filter = format!("({}={})", self.config.attr_uid, uid);
            let (results, _) = ldap
                .search(&self.config.base_dn, Scope::Subtree, &filter, vec![
                    self.config.attr_uid.as_str(),
                    self.config.attr_name.as_str(),
                    self.config.attr_email.as_str(),
                ])
                .await
                .map_err(|e| IdentityError::Backend(e.to_string()))?
                .success()
                .map_err(|e| IdentityError::Backend(e.to_string()))?;
            let entry = results.into_iter().next().ok_or(IdentityError::NoSuchIdentity(uid))?;
            let entry = SearchEntry::construct(entry);
            let name = first_attr(&entry, &self.config.attr_name).ok_or(IdentityError::NoSuchIdentity(uid))?;
            let email = first_attr(&entry, &self.config.attr_email).ok_or(IdentityError::NoSuchIdentity(uid))?;
            Ok(Identity { uid, name, email })
        }

        async fn group_owners(&self, gid: u32) -> Result<Vec<u32>, IdentityError> {
            let mut ldap = self.connect().await?;
            let filter = format!("({}={})", self.config.attr_gid, gid);
            let (results, _) = ldap
                .search(&self.config.base_dn, Scope::Subtree, &filter, vec![self.config.attr_owners.as_str()])
                .await
                .map_err(|e| IdentityError::Backend(e.to_string()))?
                .success()
                .map_err(|e| IdentityError::Backend(e.to_string()))?;
            let mut owners = Vec::new();
            for result in results {
                let entry = SearchEntry::construct(result);
                if let Some(attrs) = entry.attrs.get(&self.config.attr_owners) {
                    for value in attrs {
                        if let Ok(uid) = value.parse() {
                            owners.push(uid);
                        }
                    }
                }
            }
            Ok(owners)
        }
    }

    fn first_attr(entry: &SearchEntry, name: &str) -> Option<String> {
        entry.attrs.get(name).and_then(|v| v.first()).cloned()
    }
}

#[cfg(feature = "ldap")]
pub use ldap::LdapIdentityDirectory;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_known_uid() {
        let dir = StaticIdentityDirectory::new().with_identity(Identity {
            uid: 1000,
            name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
        });
        let identity = dir.resolve_owner(1000).await.unwrap();
        assert_eq!(identity.email, "alice@example.com");
    }

    #[tokio::test]
    async fn unknown_uid_is_fatal() {
        let dir = StaticIdentityDirectory::new();
        assert!(matches!(dir.resolve_owner(42).await, Err(IdentityError::NoSuchIdentity(42))));
    }

    #[tokio::test]
    async fn min_group_owners_satisfied_counts_owners() {
        let dir = StaticIdentityDirectory::new().with_group_owners(100, vec![1, 2, 3]);
        assert!(dir.min_group_owners_satisfied(100, 3).await.unwrap());
        assert!(!dir.min_group_owners_satisfied(100, 4).await.unwrap());
    }
}
