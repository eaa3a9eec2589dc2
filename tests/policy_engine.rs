//! Decision engine behavior over an in-memory store: precedence, per-client
//! gating, read coalescing, invalidation, and the stale fallback.

use async_trait::async_trait;
use dns_warden::config::PolicyConfig;
use dns_warden::policy::{
    AllowReason, BlockSource, BlocklistMode, BlocklistStatus, ClientProfile, DnsRewrite,
    DomainRules, GlobalBlockedApps, PolicyEngine, Rule, RuleAction, RuleOrigin, Verdict,
};
use dns_warden::settings::DnsSettings;
use dns_warden::store::{BlocklistStatusMap, RuleStore, StoreError};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockStore {
    rules: Mutex<HashMap<String, DomainRules>>,
    statuses: Mutex<BlocklistStatusMap>,
    profiles: Mutex<HashMap<IpAddr, ClientProfile>>,
    apps: Mutex<GlobalBlockedApps>,
    unavailable: AtomicBool,
    rule_reads: AtomicUsize,
}

impl MockStore {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("mock outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn set_rules(&self, domain: &str, rules: DomainRules) {
        self.rules.lock().unwrap().insert(domain.to_string(), rules);
    }

    fn set_status(&self, id: i64, enabled: bool, mode: BlocklistMode) {
        self.statuses.lock().unwrap().insert(
            id,
            BlocklistStatus {
                name: format!("list-{}", id),
                enabled,
                mode,
            },
        );
    }
}

#[async_trait]
impl RuleStore for MockStore {
    async fn rules_for_domain(&self, domain: &str) -> Result<DomainRules, StoreError> {
        self.check_available()?;
        self.rule_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rules
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }

    async fn blocklist_statuses(&self) -> Result<BlocklistStatusMap, StoreError> {
        self.check_available()?;
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn client_profile(&self, ip: IpAddr) -> Result<Option<ClientProfile>, StoreError> {
        self.check_available()?;
        Ok(self.profiles.lock().unwrap().get(&ip).cloned())
    }

    async fn global_blocked_apps(&self) -> Result<GlobalBlockedApps, StoreError> {
        self.check_available()?;
        Ok(self.apps.lock().unwrap().clone())
    }

    async fn dns_settings(&self) -> Result<DnsSettings, StoreError> {
        self.check_available()?;
        Ok(DnsSettings::default())
    }
}

fn engine_over(store: &Arc<MockStore>) -> Arc<PolicyEngine> {
    let config = PolicyConfig {
        cache_ttl_secs: 30,
        cache_capacity: 100,
        fail_open: true,
    };
    PolicyEngine::new(store.clone() as Arc<dyn RuleStore>, &config)
}

fn blocklist_rule(domain: &str, id: i64) -> Rule {
    Rule {
        domain: domain.to_string(),
        action: RuleAction::Blocked,
        origin: RuleOrigin::Blocklist(id.to_string()),
    }
}

fn imported(rules: Vec<Rule>) -> DomainRules {
    DomainRules {
        imported: rules,
        ..DomainRules::default()
    }
}

fn client(ip: &str) -> IpAddr {
    ip.parse().unwrap()
}

#[tokio::test]
async fn test_active_blocklist_blocks() {
    let store = Arc::new(MockStore::default());
    store.set_rules("ads.example.com", imported(vec![blocklist_rule("ads.example.com", 7)]));
    store.set_status(7, true, BlocklistMode::Active);
    let engine = engine_over(&store);

    let verdict = engine.decide("ads.example.com", client("10.0.0.2")).await.unwrap();
    assert!(matches!(
        verdict,
        Verdict::Blocked(BlockSource::Blocklist { id: 7, .. })
    ));
}

#[tokio::test]
async fn test_paused_or_disabled_blocklist_allows() {
    let store = Arc::new(MockStore::default());
    store.set_rules("ads.example.com", imported(vec![blocklist_rule("ads.example.com", 7)]));
    store.set_status(7, true, BlocklistMode::Paused);
    let engine = engine_over(&store);
    let verdict = engine.decide("ads.example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));

    // Disabled list on a fresh engine (same TTL window otherwise).
    let store = Arc::new(MockStore::default());
    store.set_rules("ads.example.com", imported(vec![blocklist_rule("ads.example.com", 7)]));
    store.set_status(7, false, BlocklistMode::Active);
    let engine = engine_over(&store);
    let verdict = engine.decide("ads.example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));
}

#[tokio::test]
async fn test_manual_allow_overrides_imported_block() {
    let store = Arc::new(MockStore::default());
    let mut rules = imported(vec![blocklist_rule("cdn.example.com", 1)]);
    rules.manual = Some(Rule {
        domain: "cdn.example.com".to_string(),
        action: RuleAction::Allowed,
        origin: RuleOrigin::Manual("Manual".to_string()),
    });
    store.set_rules("cdn.example.com", rules);
    store.set_status(1, true, BlocklistMode::Active);
    let engine = engine_over(&store);

    let verdict = engine.decide("cdn.example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::ManualRule));
}

#[tokio::test]
async fn test_rewrite_overrides_manual_block() {
    let store = Arc::new(MockStore::default());
    let mut rules = DomainRules::default();
    rules.rewrite = Some(DnsRewrite {
        id: 1,
        domain: "nas.example.com".to_string(),
        target: "192.168.1.50".to_string(),
    });
    rules.manual = Some(Rule {
        domain: "nas.example.com".to_string(),
        action: RuleAction::Blocked,
        origin: RuleOrigin::Manual("Manual".to_string()),
    });
    store.set_rules("nas.example.com", rules);
    let engine = engine_over(&store);

    let verdict = engine.decide("nas.example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(
        verdict,
        Verdict::Rewritten {
            target: "192.168.1.50".to_string()
        }
    );
}

#[tokio::test]
async fn test_blocklist_assignment_gates_per_client() {
    let store = Arc::new(MockStore::default());
    store.set_rules("ads.example.com", imported(vec![blocklist_rule("ads.example.com", 7)]));
    store.set_status(7, true, BlocklistMode::Active);

    let kid = client("10.0.0.5");
    let adult = client("10.0.0.6");
    store.profiles.lock().unwrap().insert(
        kid,
        ClientProfile {
            id: 1,
            name: "kid tablet".to_string(),
            ip: kid,
            use_global_settings: true,
            use_global_categories: true,
            use_global_apps: true,
            assigned_blocklists: vec![7],
        },
    );
    store.profiles.lock().unwrap().insert(
        adult,
        ClientProfile {
            id: 2,
            name: "workstation".to_string(),
            ip: adult,
            use_global_settings: true,
            use_global_categories: true,
            use_global_apps: true,
            assigned_blocklists: vec![3],
        },
    );
    let engine = engine_over(&store);

    let verdict = engine.decide("ads.example.com", kid).await.unwrap();
    assert!(matches!(verdict, Verdict::Blocked(_)));

    // List 7 not assigned to this client.
    let verdict = engine.decide("ads.example.com", adult).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));

    // No profile at all means global policy.
    let verdict = engine.decide("ads.example.com", client("10.0.0.99")).await.unwrap();
    assert!(matches!(verdict, Verdict::Blocked(_)));
}

#[tokio::test]
async fn test_category_gated_on_profile_flag() {
    let store = Arc::new(MockStore::default());
    let rule = Rule {
        domain: "casino.example.com".to_string(),
        action: RuleAction::Blocked,
        origin: RuleOrigin::Category("Gambling".to_string()),
    };
    store.set_rules("casino.example.com", imported(vec![rule]));

    let opted_out = client("10.0.0.8");
    store.profiles.lock().unwrap().insert(
        opted_out,
        ClientProfile {
            id: 1,
            name: "opted out".to_string(),
            ip: opted_out,
            use_global_settings: true,
            use_global_categories: false,
            use_global_apps: true,
            assigned_blocklists: vec![],
        },
    );
    let engine = engine_over(&store);

    let verdict = engine.decide("casino.example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Blocked(BlockSource::Category("Gambling".to_string())));

    let verdict = engine.decide("casino.example.com", opted_out).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));
}

#[tokio::test]
async fn test_app_block_and_shadow() {
    let store = Arc::new(MockStore::default());
    let rule = Rule {
        domain: "api.tikclip.example".to_string(),
        action: RuleAction::Blocked,
        origin: RuleOrigin::App("TikClip".to_string()),
    };
    store.set_rules("api.tikclip.example", imported(vec![rule.clone()]));
    store.set_rules("api.shadowed.example", imported(vec![Rule {
        domain: "api.shadowed.example".to_string(),
        origin: RuleOrigin::App("Shadowed".to_string()),
        ..rule
    }]));
    *store.apps.lock().unwrap() = GlobalBlockedApps {
        blocked_apps: vec!["TikClip".to_string()],
        shadow_apps: vec!["Shadowed".to_string()],
    };
    let engine = engine_over(&store);

    let verdict = engine.decide("api.tikclip.example", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Blocked(BlockSource::App("TikClip".to_string())));

    // Shadow apps resolve normally but the verdict carries the tag.
    let verdict = engine.decide("api.shadowed.example", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::ShadowApp("Shadowed".to_string())));
}

#[tokio::test]
async fn test_concurrent_decides_coalesce_to_one_read() {
    let store = Arc::new(MockStore::default());
    store.set_rules("popular.example.com", DomainRules::default());
    let engine = engine_over(&store);

    let mut handles = Vec::new();
    for _ in 0..32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.decide("popular.example.com", client("10.0.0.2")).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(store.rule_reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalidation_takes_effect_before_ttl() {
    let store = Arc::new(MockStore::default());
    store.set_rules("example.com", DomainRules::default());
    let engine = engine_over(&store);

    let verdict = engine.decide("example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));

    // Store changes alone stay invisible within the TTL.
    let mut rules = DomainRules::default();
    rules.manual = Some(Rule {
        domain: "example.com".to_string(),
        action: RuleAction::Blocked,
        origin: RuleOrigin::Manual("Manual".to_string()),
    });
    store.set_rules("example.com", rules);
    let verdict = engine.decide("example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));

    engine.invalidate_domain("example.com");
    let verdict = engine.decide("example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Blocked(BlockSource::ManualRule));
}

#[tokio::test(start_paused = true)]
async fn test_stale_value_served_during_outage() {
    let store = Arc::new(MockStore::default());
    store.set_rules("example.com", DomainRules::default());
    let engine = engine_over(&store);

    let verdict = engine.decide("example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));

    // Past the TTL with the store down: the expired entry still answers.
    store.unavailable.store(true, Ordering::SeqCst);
    tokio::time::advance(std::time::Duration::from_secs(60)).await;
    let verdict = engine.decide("example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));

    // A never-cached domain has nothing to fall back to.
    let err = engine.decide("fresh.example.com", client("10.0.0.2")).await;
    assert!(matches!(err, Err(StoreError::Unavailable(_))));
}
