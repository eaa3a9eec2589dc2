//! End-to-end pipeline over a real UDP socket with an in-memory store and a
//! scripted upstream: block responses, rewrites, forwarding, SERVFAIL, and
//! the stale-while-revalidate refresh.

use async_trait::async_trait;
use dns_warden::config::Config;
use dns_warden::logger::QueryLogger;
use dns_warden::policy::{DnsRewrite, DomainRules, PolicyEngine, Rule, RuleAction, RuleOrigin};
use dns_warden::server::DnsHandler;
use dns_warden::settings::DnsSettings;
use dns_warden::stats::StatsCollector;
use dns_warden::store::{BlocklistStatusMap, RuleStore, StoreError};
use dns_warden::upstream::{Upstream, UpstreamError};
use hickory_server::proto::op::{Message, Query, ResponseCode};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::ServerFuture;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;

#[derive(Default)]
struct MockStore {
    rules: Mutex<HashMap<String, DomainRules>>,
}

#[async_trait]
impl RuleStore for MockStore {
    async fn rules_for_domain(&self, domain: &str) -> Result<DomainRules, StoreError> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }

    async fn blocklist_statuses(&self) -> Result<BlocklistStatusMap, StoreError> {
        Ok(BlocklistStatusMap::default())
    }

    async fn client_profile(
        &self,
        _ip: IpAddr,
    ) -> Result<Option<dns_warden::policy::ClientProfile>, StoreError> {
        Ok(None)
    }

    async fn global_blocked_apps(
        &self,
    ) -> Result<dns_warden::policy::GlobalBlockedApps, StoreError> {
        Ok(Default::default())
    }

    async fn dns_settings(&self) -> Result<DnsSettings, StoreError> {
        Ok(DnsSettings::default())
    }
}

struct MockUpstream {
    call_count: Arc<AtomicUsize>,
    fail: AtomicBool,
    ttl: u32,
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn resolve(&self, name: &str, _qtype: RecordType) -> Result<Vec<Record>, UpstreamError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(UpstreamError::Unreachable("mock down".to_string()));
        }
        let name = Name::from_ascii(name).map_err(|e| UpstreamError::Unreachable(e.to_string()))?;
        Ok(vec![Record::from_rdata(
            name,
            self.ttl,
            RData::A("1.2.3.4".parse().unwrap()),
        )])
    }

    fn label(&self) -> &str {
        "mock"
    }
}

struct TestServer {
    client: UdpSocket,
    upstream_calls: Arc<AtomicUsize>,
}

async fn start_server(store: MockStore, upstream_ttl: u32, config: Config) -> TestServer {
    let stats = StatsCollector::new(3600);
    let logger = QueryLogger::with_sinks(vec![]);
    let engine = PolicyEngine::new(Arc::new(store), &config.policy);
    let call_count = Arc::new(AtomicUsize::new(0));
    let upstream = Arc::new(MockUpstream {
        call_count: call_count.clone(),
        fail: AtomicBool::new(false),
        ttl: upstream_ttl,
    });

    let handler = DnsHandler::new(config, stats, logger, engine, upstream);

    let mut server = ServerFuture::new(handler);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    server.register_socket(socket);
    tokio::spawn(async move {
        let _ = server.block_until_done().await;
    });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(addr).await.unwrap();
    TestServer {
        client,
        upstream_calls: call_count,
    }
}

async fn start_failing_server(store: MockStore, config: Config) -> TestServer {
    let stats = StatsCollector::new(3600);
    let logger = QueryLogger::with_sinks(vec![]);
    let engine = PolicyEngine::new(Arc::new(store), &config.policy);
    let call_count = Arc::new(AtomicUsize::new(0));
    let upstream = Arc::new(MockUpstream {
        call_count: call_count.clone(),
        fail: AtomicBool::new(true),
        ttl: 300,
    });

    let handler = DnsHandler::new(config, stats, logger, engine, upstream);
    let mut server = ServerFuture::new(handler);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    server.register_socket(socket);
    tokio::spawn(async move {
        let _ = server.block_until_done().await;
    });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(addr).await.unwrap();
    TestServer {
        client,
        upstream_calls: call_count,
    }
}

async fn query(server: &TestServer, name: &str, qtype: RecordType, id: u16) -> Message {
    let mut msg = Message::new();
    msg.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
    msg.set_id(id);
    server.client.send(&msg.to_vec().unwrap()).await.unwrap();

    let mut buf = [0u8; 512];
    let (len, _): (usize, SocketAddr) = server.client.recv_from(&mut buf).await.unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

fn blocked_rules(domain: &str) -> DomainRules {
    DomainRules {
        manual: Some(Rule {
            domain: domain.to_string(),
            action: RuleAction::Blocked,
            origin: RuleOrigin::Manual("Manual".to_string()),
        }),
        ..DomainRules::default()
    }
}

#[tokio::test]
async fn test_blocked_domain_answers_null_address() {
    let store = MockStore::default();
    store
        .rules
        .lock()
        .unwrap()
        .insert("ads.example.com".to_string(), blocked_rules("ads.example.com"));
    let server = start_server(store, 300, Config::default()).await;

    let resp = query(&server, "ads.example.com.", RecordType::A, 1).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(resp.answers().len(), 1);
    assert_eq!(
        resp.answers()[0].data(),
        &RData::A("0.0.0.0".parse().unwrap())
    );
    assert_eq!(server.upstream_calls.load(Ordering::SeqCst), 0);

    // Non-address query types get NXDOMAIN.
    let resp = query(&server, "ads.example.com.", RecordType::TXT, 2).await;
    assert_eq!(resp.response_code(), ResponseCode::NXDomain);
    assert_eq!(server.upstream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rewrite_synthesizes_address() {
    let store = MockStore::default();
    store.rules.lock().unwrap().insert(
        "nas.home.lan".to_string(),
        DomainRules {
            rewrite: Some(DnsRewrite {
                id: 1,
                domain: "nas.home.lan".to_string(),
                target: "192.168.1.50".to_string(),
            }),
            ..DomainRules::default()
        },
    );
    let server = start_server(store, 300, Config::default()).await;

    let resp = query(&server, "nas.home.lan.", RecordType::A, 3).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(
        resp.answers()[0].data(),
        &RData::A("192.168.1.50".parse().unwrap())
    );
    // Queried name stays on the synthesized record.
    assert_eq!(resp.answers()[0].name(), &Name::from_ascii("nas.home.lan.").unwrap());
    assert_eq!(server.upstream_calls.load(Ordering::SeqCst), 0);

    // AAAA query against a v4 target: NODATA, not the v4 answer.
    let resp = query(&server, "nas.home.lan.", RecordType::AAAA, 4).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert!(resp.answers().is_empty());
}

#[tokio::test]
async fn test_allowed_domain_forwards_upstream() {
    let server = start_server(MockStore::default(), 300, Config::default()).await;

    let resp = query(&server, "example.com.", RecordType::A, 5).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(
        resp.answers()[0].data(),
        &RData::A("1.2.3.4".parse().unwrap())
    );
    assert_eq!(server.upstream_calls.load(Ordering::SeqCst), 1);

    // Second identical query is served from the response cache.
    let resp = query(&server, "example.com.", RecordType::A, 6).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(server.upstream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upstream_failure_answers_servfail() {
    let server = start_failing_server(MockStore::default(), Config::default()).await;

    let resp = query(&server, "example.com.", RecordType::A, 7).await;
    assert_eq!(resp.response_code(), ResponseCode::ServFail);
    assert!(resp.answers().is_empty());
    // One attempt, no retry.
    assert_eq!(server.upstream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_response_triggers_background_refresh() {
    let mut config = Config::default();
    config.cache.min_ttl = 1;
    config.cache.grace_period_sec = 5;
    let server = start_server(MockStore::default(), 1, config).await;

    let resp = query(&server, "example.com.", RecordType::A, 8).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(server.upstream_calls.load(Ordering::SeqCst), 1);

    // Past the 1s TTL but inside the 5s grace window.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let resp = query(&server, "example.com.", RecordType::A, 9).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert!(!resp.answers().is_empty());

    let mut calls = 0;
    for _ in 0..20 {
        calls = server.upstream_calls.load(Ordering::SeqCst);
        if calls >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(calls >= 2, "expected a background re-resolution, saw {} calls", calls);
}
