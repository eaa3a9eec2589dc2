use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal;
use tracing::{error, info};

use dns_warden::admin::AdminService;
use dns_warden::config::Config;
use dns_warden::init::{init_store, setup_logging};
use dns_warden::logger::QueryLogger;
use dns_warden::policy::PolicyEngine;
use dns_warden::refresh::{BlocklistRefresher, RefreshRequest};
use dns_warden::server::DnsHandler;
use dns_warden::stats::StatsCollector;
use dns_warden::store::RuleStore;
use dns_warden::upstream::build_upstream;
use hickory_server::ServerFuture;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load Config
    let config_path = std::env::args().nth(1).unwrap_or("config.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).await?
    } else {
        Config::default()
    };

    // 2. Setup Logging
    setup_logging(&config);
    info!("Starting dns-warden...");

    if !std::path::Path::new(&config_path).exists() {
        info!("Config file not found, using defaults.");
    }

    // 3. Rule store
    let store = init_store(&config)?;

    // 4. Stats & query logger
    let stats = StatsCollector::new(config.stats.log_interval_seconds);
    let logger = QueryLogger::new(config.logging.clone(), store.db_path());

    // 5. Policy engine over the store
    let engine = PolicyEngine::new(Arc::new(store.clone()), &config.policy);

    // 6. Upstream from persisted settings
    let settings = RuleStore::dns_settings(&store).await?;
    let upstream = build_upstream(&settings, &config.upstream).await?;

    // 7. DNS handler
    let handler = DnsHandler::new(
        config.clone(),
        stats.clone(),
        logger.clone(),
        engine.clone(),
        upstream,
    );

    // 8. Blocklist refresher: periodic plus on-demand via channel
    let (refresh_tx, refresh_rx) = tokio::sync::mpsc::channel::<RefreshRequest>(8);
    // The interval's first tick fires immediately, so lists sync at startup.
    let refresher = BlocklistRefresher::new(config.clone(), store.clone(), engine.clone());
    tokio::spawn(refresher.run(refresh_rx));

    // 9. Settings watcher: rebuild the upstream when the admin writes new
    // settings. The old upstream serves until the new one is ready.
    let (settings_tx, mut settings_rx) = tokio::sync::watch::channel(settings);
    let watcher_handler = handler.clone();
    let watcher_config = config.upstream.clone();
    tokio::spawn(async move {
        while settings_rx.changed().await.is_ok() {
            let settings = settings_rx.borrow_and_update().clone();
            match build_upstream(&settings, &watcher_config).await {
                Ok(upstream) => {
                    info!("Upstream switched to {:?}", settings.upstream_mode);
                    watcher_handler.set_upstream(upstream);
                }
                Err(e) => error!("Failed to rebuild upstream, keeping current: {}", e),
            }
        }
    });

    // 10. Admin API
    let admin = AdminService::new(store, engine, settings_tx, refresh_tx);
    let api_stats = stats.clone();
    let api_port = config.api_port;
    tokio::spawn(async move {
        dns_warden::api::start_api_server(admin, api_stats, api_port).await;
    });

    // 11. DNS server on UDP and TCP
    let mut server = ServerFuture::new(handler);
    let addr = SocketAddr::new(config.host.parse()?, config.port);

    let udp_socket = UdpSocket::bind(addr).await?;
    server.register_socket(udp_socket);

    let tcp_listener = TcpListener::bind(addr).await?;
    server.register_listener(tcp_listener, Duration::from_secs(5));

    info!("DNS server listening on {}", addr);

    // 12. Graceful shutdown
    tokio::select! {
        _ = server.block_until_done() => {},
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received.");
        }
    }

    Ok(())
}
