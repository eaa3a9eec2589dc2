//! Durable storage for rules, profiles, blocklists, and settings.
//!
//! The decision engine only sees the read-side [`RuleStore`] trait; tests
//! substitute an in-memory implementation. Admin mutations live on the
//! concrete [`SqliteStore`].

mod sqlite;

pub use self::sqlite::{SqliteStore, StoredQueryLog};

use crate::policy::types::{BlocklistStatus, ClientProfile, DomainRules, GlobalBlockedApps};
use crate::settings::DnsSettings;
use rustc_hash::FxHashMap;
use std::net::IpAddr;
use thiserror::Error;

/// Blocklist id -> enforcement status, fetched as one snapshot.
pub type BlocklistStatusMap = FxHashMap<i64, BlocklistStatus>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt store row: {0}")]
    Corrupt(String),
    /// Uniqueness violation: one rule (or rewrite) per domain.
    #[error("an entry already exists for domain '{0}'")]
    Conflict(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Point-in-time reads the policy cache layer wraps. Each call returns a
/// complete snapshot for its key; the cache layer never merges partial reads.
#[async_trait::async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules and the rewrite (if any) for an exact domain. The domain is
    /// expected lowercased by the caller.
    async fn rules_for_domain(&self, domain: &str) -> Result<DomainRules, StoreError>;

    async fn blocklist_statuses(&self) -> Result<BlocklistStatusMap, StoreError>;

    async fn client_profile(&self, ip: IpAddr) -> Result<Option<ClientProfile>, StoreError>;

    async fn global_blocked_apps(&self) -> Result<GlobalBlockedApps, StoreError>;

    async fn dns_settings(&self) -> Result<DnsSettings, StoreError>;
}
