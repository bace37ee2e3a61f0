//! TSIG credential store: per-domain-suffix key material.
//!
//! Lookups walk successive parent labels of a name until a stored suffix
//! matches. Entries marked for deletion linger until their delete time has
//! passed and nothing still depends on their encrypted transport; the engine
//! re-resolves every question's credential binding after additions and
//! purges.

use std::time::Instant;

use log::{debug, info};

use crate::message::Name;
use crate::message::tsig::TsigKey;
use shared::error::{Error, Result};

/// Credentials for one domain suffix.
#[derive(Debug, Clone)]
pub struct DomainAuthInfo {
    pub domain: Name,
    pub key: TsigKey,
    /// Operations under this domain must run over the private transport.
    pub requires_tls: bool,
    delete_at: Option<Instant>,
}

impl DomainAuthInfo {
    fn expired(&self, now: Instant) -> bool {
        self.delete_at.is_some_and(|t| t <= now)
    }
}

/// Ordered store of domain credentials.
#[derive(Default)]
pub struct CredentialStore {
    list: Vec<DomainAuthInfo>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs credentials for a domain suffix.
    ///
    /// Fails with [`Error::ErrBadParameter`] when the key material does not
    /// convert to an HMAC key, and with [`Error::ErrAlreadyRegistered`] when
    /// a live entry for the domain already exists. An expired entry is
    /// replaced in place.
    pub fn set_secret(
        &mut self,
        domain: Name,
        key_name: Name,
        b64_key: &str,
        requires_tls: bool,
    ) -> Result<()> {
        // Validate the key material before touching the list.
        let key = TsigKey::from_base64(key_name, b64_key)?;

        if let Some(existing) = self.list.iter_mut().find(|e| e.domain == domain) {
            if existing.delete_at.is_none() {
                return Err(Error::ErrAlreadyRegistered);
            }
            info!("set_secret: replacing expired credentials for {domain}");
            existing.key = key;
            existing.requires_tls = requires_tls;
            existing.delete_at = None;
            return Ok(());
        }

        info!("set_secret: domain {domain} key {}", key.name);
        self.list.push(DomainAuthInfo {
            domain,
            key,
            requires_tls,
            delete_at: None,
        });
        Ok(())
    }

    /// Marks a domain's credentials for deletion at `at`.
    pub fn delete_secret(&mut self, domain: &Name, at: Instant) -> Result<()> {
        let entry = self
            .list
            .iter_mut()
            .find(|e| e.domain == *domain)
            .ok_or(Error::ErrNoSuchName)?;
        entry.delete_at = Some(at);
        Ok(())
    }

    /// Finds credentials for `name` by walking its ancestor suffixes,
    /// ignoring entries already past their delete time.
    pub fn lookup(&self, name: &Name, now: Instant) -> Option<&DomainAuthInfo> {
        let mut n = Some(name.clone());
        while let Some(cur) = n {
            if cur.is_root() {
                break;
            }
            for entry in &self.list {
                if !entry.expired(now) && entry.domain == cur {
                    debug!("credential lookup {} matched {}", name, entry.domain);
                    return Some(entry);
                }
            }
            n = cur.parent();
        }
        None
    }

    /// Removes entries whose delete time has passed and which no live
    /// transport still requires, returning the purged domains so the caller
    /// can rebind affected questions.
    pub fn purge_expired(
        &mut self,
        now: Instant,
        transport_in_use: impl Fn(&Name) -> bool,
    ) -> Vec<Name> {
        let mut purged = vec![];
        self.list.retain(|e| {
            if e.expired(now) && !transport_in_use(&e.domain) {
                info!("purging expired credentials for {}", e.domain);
                purged.push(e.domain.clone());
                false
            } else {
                true
            }
        });
        purged
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const KEY: &str = "bW9zdGx5LXNlY3JldC1rZXktbWF0ZXJpYWw=";

    fn store_with(domain: &str) -> CredentialStore {
        let mut store = CredentialStore::new();
        store
            .set_secret(
                Name::new(domain).unwrap(),
                Name::new("key.example.com.").unwrap(),
                KEY,
                false,
            )
            .unwrap();
        store
    }

    #[test]
    fn test_set_secret_rejects_bad_key() {
        let mut store = CredentialStore::new();
        let err = store
            .set_secret(
                Name::new("example.com.").unwrap(),
                Name::new("key.").unwrap(),
                "*** definitely not base64 ***",
                false,
            )
            .unwrap_err();
        assert_eq!(err, Error::ErrBadParameter);
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_secret_rejects_duplicate_domain() {
        let mut store = store_with("example.com.");
        let err = store
            .set_secret(
                Name::new("example.com.").unwrap(),
                Name::new("other-key.").unwrap(),
                KEY,
                true,
            )
            .unwrap_err();
        assert_eq!(err, Error::ErrAlreadyRegistered);
    }

    #[test]
    fn test_lookup_walks_parent_suffixes() {
        let store = store_with("example.com.");
        let now = Instant::now();
        let hit = store
            .lookup(&Name::new("a.b.example.com.").unwrap(), now)
            .unwrap();
        assert_eq!(hit.domain.data, "example.com.");
        assert!(
            store
                .lookup(&Name::new("a.b.example.org.").unwrap(), now)
                .is_none()
        );
    }

    #[test]
    fn test_purge_respects_transport_dependency() {
        let mut store = store_with("example.com.");
        let now = Instant::now();
        let domain = Name::new("example.com.").unwrap();
        store.delete_secret(&domain, now).unwrap();

        // Still required by a live transport: stays, but no longer matches
        // lookups once past its delete time.
        let purged = store.purge_expired(now + Duration::from_secs(1), |_| true);
        assert!(purged.is_empty());
        assert!(
            store
                .lookup(&Name::new("x.example.com.").unwrap(), now + Duration::from_secs(1))
                .is_none()
        );

        // Transport gone: entry goes away and is reported.
        let purged = store.purge_expired(now + Duration::from_secs(2), |_| false);
        assert_eq!(purged, vec![domain]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_lookup_prefers_most_specific_suffix() {
        let mut store = store_with("example.com.");
        store
            .set_secret(
                Name::new("sub.example.com.").unwrap(),
                Name::new("subkey.").unwrap(),
                KEY,
                true,
            )
            .unwrap();
        let hit = store
            .lookup(&Name::new("host.sub.example.com.").unwrap(), Instant::now())
            .unwrap();
        assert_eq!(hit.domain.data, "sub.example.com.");
        assert!(hit.requires_tls);
    }
}
