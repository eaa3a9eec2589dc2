//! Admin mutations paired with their cache invalidations: a read after a
//! successful mutation must not see the pre-mutation policy.

use dns_warden::admin::AdminService;
use dns_warden::config::PolicyConfig;
use dns_warden::policy::{AllowReason, PolicyEngine, RuleAction, Verdict};
use dns_warden::settings::DnsSettings;
use dns_warden::store::{RuleStore, SqliteStore};
use std::net::IpAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

struct Fixture {
    _dir: TempDir,
    store: SqliteStore,
    engine: Arc<PolicyEngine>,
    admin: Arc<AdminService>,
    settings_rx: watch::Receiver<DnsSettings>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("admin.db");
    let store = SqliteStore::new(path.to_str().unwrap()).unwrap();
    store.initialize().unwrap();

    let engine = PolicyEngine::new(
        Arc::new(store.clone()) as Arc<dyn RuleStore>,
        &PolicyConfig {
            cache_ttl_secs: 30,
            cache_capacity: 100,
            fail_open: true,
        },
    );
    let (settings_tx, settings_rx) = watch::channel(DnsSettings::default());
    let (refresh_tx, _refresh_rx) = mpsc::channel(8);
    // The receiver is dropped; the admin sends refresh requests
    // fire-and-forget, so nothing blocks.
    let admin = AdminService::new(store.clone(), engine.clone(), settings_tx, refresh_tx);

    Fixture {
        _dir: dir,
        store,
        engine,
        admin,
        settings_rx,
    }
}

fn client(ip: &str) -> IpAddr {
    ip.parse().unwrap()
}

#[tokio::test]
async fn test_rule_create_visible_immediately() {
    let f = fixture();

    // Warm the domain cache with "no rules".
    let verdict = f.engine.decide("ads.example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));

    f.admin
        .create_rule("ads.example.com".to_string(), RuleAction::Blocked)
        .await
        .unwrap();

    // Well inside the 30s TTL, yet the block applies.
    let verdict = f.engine.decide("ads.example.com", client("10.0.0.2")).await.unwrap();
    assert!(matches!(verdict, Verdict::Blocked(_)));
}

#[tokio::test]
async fn test_blocklist_create_refreshes_status_snapshot() {
    let f = fixture();

    // An imported rule whose list does not exist yet; deciding on it caches
    // a status snapshot without the id.
    f.store
        .insert_rule(
            "tracker.example.com".to_string(),
            RuleAction::Blocked,
            "Blocklist:1".to_string(),
        )
        .await
        .unwrap();
    let verdict = f.engine.decide("tracker.example.com", client("10.0.0.2")).await.unwrap();
    assert_eq!(verdict, Verdict::Allowed(AllowReason::Default));

    // Creating the list (autoincrement id 1) must drop that snapshot so the
    // rule enforces without waiting out the TTL.
    let id = f.admin
        .create_blocklist("Trackers".to_string(), "https://lists.example/t.txt".to_string())
        .await
        .unwrap();
    assert_eq!(id, 1);

    let verdict = f.engine.decide("tracker.example.com", client("10.0.0.2")).await.unwrap();
    assert!(matches!(verdict, Verdict::Blocked(_)));
}

#[tokio::test]
async fn test_settings_write_notifies_watcher() {
    let mut f = fixture();

    let raw: dns_warden::settings::RawDnsSettings = serde_json::from_str(
        r#"{"upstream_mode":"forward","forward":{"transport":"dot","host":"1.1.1.1"}}"#,
    )
    .unwrap();
    let written = f.admin.update_dns_settings(raw).await.unwrap();

    assert!(f.settings_rx.has_changed().unwrap());
    assert_eq!(*f.settings_rx.borrow_and_update(), written);

    // Invalid settings are rejected before persistence and no notification
    // goes out.
    let raw: dns_warden::settings::RawDnsSettings =
        serde_json::from_str(r#"{"upstream_mode":"forward","forward":{"transport":"doh"}}"#)
            .unwrap();
    assert!(f.admin.update_dns_settings(raw).await.is_err());
    assert!(!f.settings_rx.has_changed().unwrap());
    assert_eq!(RuleStore::dns_settings(&f.store).await.unwrap(), written);
}
