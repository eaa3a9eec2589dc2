//! Per-query policy evaluation.
//!
//! Precedence is a fixed total order, first match wins:
//! rewrite > manual rule > blocklist rule > category rule > app rule >
//! default ALLOWED.

use super::cache::CoalescingCache;
use super::types::{
    AllowReason, BlockSource, ClientProfile, DomainRules, GlobalBlockedApps, RuleAction,
    RuleOrigin, Verdict,
};
use crate::config::PolicyConfig;
use crate::store::{BlocklistStatusMap, RuleStore, StoreError};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct PolicyEngine {
    store: Arc<dyn RuleStore>,
    domain_rules: CoalescingCache<Arc<str>, DomainRules>,
    profiles: CoalescingCache<IpAddr, Option<ClientProfile>>,
    statuses: CoalescingCache<(), BlocklistStatusMap>,
    apps: CoalescingCache<(), GlobalBlockedApps>,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn RuleStore>, config: &PolicyConfig) -> Arc<Self> {
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Arc::new(Self {
            store,
            domain_rules: CoalescingCache::new("domain_rules", ttl, config.cache_capacity),
            profiles: CoalescingCache::new("client_profiles", ttl, config.cache_capacity),
            statuses: CoalescingCache::new("blocklist_statuses", ttl, 1),
            apps: CoalescingCache::new("global_apps", ttl, 1),
        })
    }

    /// Evaluates the verdict for one (domain, client) pair. `domain` must be
    /// lowercased with the trailing dot stripped.
    ///
    /// Errors surface only when the store is down AND no cached value exists
    /// for a needed key; the pipeline chooses fail-open or fail-closed.
    pub async fn decide(&self, domain: &str, client_ip: IpAddr) -> Result<Verdict, StoreError> {
        let rules = self.domain_rules(domain).await?;

        // 1. Static rewrite wins over everything, including blocks.
        if let Some(rewrite) = &rules.rewrite {
            return Ok(Verdict::Rewritten {
                target: rewrite.target.clone(),
            });
        }

        // 2. A manual rule is authoritative in either direction.
        if let Some(manual) = &rules.manual {
            return Ok(match manual.action {
                RuleAction::Blocked => Verdict::Blocked(BlockSource::ManualRule),
                RuleAction::Allowed => Verdict::Allowed(AllowReason::ManualRule),
            });
        }

        if rules.imported.is_empty() {
            return Ok(Verdict::Allowed(AllowReason::Default));
        }

        let profile_snapshot = self.client_profile(client_ip).await?;
        // Absent profile means the default global policy applies.
        let profile: Option<&ClientProfile> = Option::as_ref(&*profile_snapshot);

        // 3. Imported blocklist rules, gated on list status and assignment.
        let blocklist_ids: Vec<i64> = rules
            .imported
            .iter()
            .filter(|r| r.action == RuleAction::Blocked)
            .filter_map(|r| match &r.origin {
                RuleOrigin::Blocklist(raw_id) => raw_id.parse::<i64>().ok(),
                _ => None,
            })
            .collect();
        if !blocklist_ids.is_empty() {
            let statuses = self.blocklist_statuses().await?;
            for id in blocklist_ids {
                let Some(status) = statuses.get(&id) else {
                    continue;
                };
                let assigned = profile.map_or(true, |p| p.blocklist_applies(id));
                if status.is_enforcing() && assigned {
                    return Ok(Verdict::Blocked(BlockSource::Blocklist {
                        id,
                        name: status.name.clone(),
                    }));
                }
            }
        }

        // 4. Category rules, gated on the client's use_global_categories.
        let use_categories = profile.map_or(true, |p| p.use_global_categories);
        if use_categories {
            for rule in &rules.imported {
                if let RuleOrigin::Category(name) = &rule.origin {
                    if rule.action == RuleAction::Blocked {
                        return Ok(Verdict::Blocked(BlockSource::Category(name.clone())));
                    }
                }
            }
        }

        // 5. App rules, gated on use_global_apps and the global app policy.
        let use_apps = profile.map_or(true, |p| p.use_global_apps);
        if use_apps {
            let app_rules: Vec<&str> = rules
                .imported
                .iter()
                .filter(|r| r.action == RuleAction::Blocked)
                .filter_map(|r| match &r.origin {
                    RuleOrigin::App(name) => Some(name.as_str()),
                    _ => None,
                })
                .collect();
            if !app_rules.is_empty() {
                let policy = self.global_blocked_apps().await?;
                let mut shadowed: Option<&str> = None;
                for name in app_rules {
                    if policy.blocked_apps.iter().any(|a| a == name) {
                        return Ok(Verdict::Blocked(BlockSource::App(name.to_string())));
                    }
                    if shadowed.is_none() && policy.shadow_apps.iter().any(|a| a == name) {
                        shadowed = Some(name);
                    }
                }
                if let Some(app) = shadowed {
                    return Ok(Verdict::Allowed(AllowReason::ShadowApp(app.to_string())));
                }
            }
        }

        Ok(Verdict::Allowed(AllowReason::Default))
    }

    async fn domain_rules(&self, domain: &str) -> Result<Arc<DomainRules>, StoreError> {
        let key: Arc<str> = Arc::from(domain);
        let store = self.store.clone();
        let domain = domain.to_string();
        self.domain_rules
            .get_with(key, async move { store.rules_for_domain(&domain).await })
            .await
    }

    async fn client_profile(&self, ip: IpAddr) -> Result<Arc<Option<ClientProfile>>, StoreError> {
        let store = self.store.clone();
        self.profiles
            .get_with(ip, async move { store.client_profile(ip).await })
            .await
    }

    async fn blocklist_statuses(&self) -> Result<Arc<BlocklistStatusMap>, StoreError> {
        let store = self.store.clone();
        self.statuses
            .get_with((), async move { store.blocklist_statuses().await })
            .await
    }

    async fn global_blocked_apps(&self) -> Result<Arc<GlobalBlockedApps>, StoreError> {
        let store = self.store.clone();
        self.apps
            .get_with((), async move { store.global_blocked_apps().await })
            .await
    }

    // Invalidation hooks, called synchronously by admin mutations so
    // staleness is zero on explicit action and bounded by the TTL otherwise.

    pub fn invalidate_domain(&self, domain: &str) {
        self.domain_rules.invalidate(&Arc::from(domain));
    }

    pub fn invalidate_all_domains(&self) {
        self.domain_rules.reset_all();
    }

    pub fn invalidate_client(&self, ip: IpAddr) {
        self.profiles.invalidate(&ip);
    }

    pub fn invalidate_all_clients(&self) {
        self.profiles.reset_all();
    }

    pub fn invalidate_blocklist_statuses(&self) {
        self.statuses.reset_all();
    }

    pub fn invalidate_global_apps(&self) {
        self.apps.reset_all();
    }

    /// Drops every cached entry. Used by tests and the admin reset endpoint.
    pub fn reset_all(&self) {
        self.domain_rules.reset_all();
        self.profiles.reset_all();
        self.statuses.reset_all();
        self.apps.reset_all();
    }
}
