//! Control-plane mutations. Every write goes through here so the matching
//! policy cache invalidation happens before the call returns; a read after
//! a successful mutation never sees the pre-mutation value served from
//! cache.

use crate::policy::types::{ClientProfile, GlobalBlockedApps, RuleAction};
use crate::policy::PolicyEngine;
use crate::refresh::RefreshRequest;
use crate::settings::{DnsSettings, RawDnsSettings, SettingsError};
use crate::store::{RuleStore, SqliteStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::info;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("not found")]
    NotFound,
}

pub struct AdminService {
    store: SqliteStore,
    engine: Arc<PolicyEngine>,
    /// Notifies the upstream watcher after a successful settings write.
    settings_tx: watch::Sender<DnsSettings>,
    refresh_tx: mpsc::Sender<RefreshRequest>,
}

impl AdminService {
    pub fn new(
        store: SqliteStore,
        engine: Arc<PolicyEngine>,
        settings_tx: watch::Sender<DnsSettings>,
        refresh_tx: mpsc::Sender<RefreshRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            settings_tx,
            refresh_tx,
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    // ---- Manual rules ----

    pub async fn create_rule(&self, domain: String, action: RuleAction) -> Result<(), AdminError> {
        let domain = domain.to_lowercase();
        self.store
            .insert_rule(domain.clone(), action, "Manual".to_string())
            .await?;
        self.engine.invalidate_domain(&domain);
        Ok(())
    }

    pub async fn delete_rule(&self, domain: String) -> Result<(), AdminError> {
        let domain = domain.to_lowercase();
        if !self.store.delete_rule(domain.clone()).await? {
            return Err(AdminError::NotFound);
        }
        self.engine.invalidate_domain(&domain);
        Ok(())
    }

    // ---- Blocklists ----

    pub async fn create_blocklist(&self, name: String, url: String) -> Result<i64, AdminError> {
        let id = self.store.create_blocklist(name, url).await?;
        // A status snapshot cached before the insert lacks the new id and
        // would skip its rules until the TTL; drop it now.
        self.engine.invalidate_blocklist_statuses();
        // Fetch in the background; the list enforces once its rules land.
        let _ = self.refresh_tx.try_send(RefreshRequest::One(id));
        Ok(id)
    }

    pub async fn set_blocklist_state(
        &self,
        id: i64,
        enabled: Option<bool>,
        mode: Option<crate::policy::types::BlocklistMode>,
    ) -> Result<(), AdminError> {
        if !self.store.set_blocklist_state(id, enabled, mode).await? {
            return Err(AdminError::NotFound);
        }
        self.engine.invalidate_blocklist_statuses();
        Ok(())
    }

    pub async fn delete_blocklist(&self, id: i64) -> Result<(), AdminError> {
        if !self.store.delete_blocklist(id).await? {
            return Err(AdminError::NotFound);
        }
        // Imported rules went away with the list.
        self.engine.invalidate_blocklist_statuses();
        self.engine.invalidate_all_domains();
        Ok(())
    }

    pub async fn trigger_refresh(&self, id: Option<i64>) {
        let req = match id {
            Some(id) => RefreshRequest::One(id),
            None => RefreshRequest::All,
        };
        let _ = self.refresh_tx.try_send(req);
    }

    // ---- Client profiles ----

    pub async fn upsert_client_profile(&self, profile: ClientProfile) -> Result<i64, AdminError> {
        let ip = profile.ip;
        let id = self.store.upsert_client_profile(profile).await?;
        self.engine.invalidate_client(ip);
        Ok(id)
    }

    pub async fn delete_client_profile(&self, id: i64) -> Result<(), AdminError> {
        match self.store.delete_client_profile(id).await? {
            Some(ip) => {
                self.engine.invalidate_client(ip);
                Ok(())
            }
            None => Err(AdminError::NotFound),
        }
    }

    // ---- Global apps ----

    pub async fn set_global_blocked_apps(
        &self,
        apps: GlobalBlockedApps,
    ) -> Result<(), AdminError> {
        self.store.set_global_blocked_apps(apps).await?;
        self.engine.invalidate_global_apps();
        Ok(())
    }

    // ---- Rewrites ----

    pub async fn create_rewrite(&self, domain: String, target: String) -> Result<i64, AdminError> {
        let domain = domain.to_lowercase();
        let id = self.store.create_rewrite(domain.clone(), target).await?;
        self.engine.invalidate_domain(&domain);
        Ok(id)
    }

    pub async fn delete_rewrite(&self, id: i64) -> Result<(), AdminError> {
        match self.store.delete_rewrite(id).await? {
            Some(domain) => {
                self.engine.invalidate_domain(&domain);
                Ok(())
            }
            None => Err(AdminError::NotFound),
        }
    }

    // ---- DNS settings ----

    pub async fn dns_settings(&self) -> Result<DnsSettings, AdminError> {
        Ok(RuleStore::dns_settings(&self.store).await?)
    }

    /// Validates first; nothing is persisted and no swap happens when
    /// normalization fails.
    pub async fn update_dns_settings(&self, raw: RawDnsSettings) -> Result<DnsSettings, AdminError> {
        let settings = raw.normalize()?;
        self.store.write_dns_settings(settings.clone()).await?;
        info!("DNS settings updated: {:?}", settings.upstream_mode);
        let _ = self.settings_tx.send(settings.clone());
        Ok(settings)
    }
}
