//! Periodic blocklist downloads. Each list is streamed line by line,
//! parsed into domains, and diffed into the rule store under the
//! `Blocklist:<id>` origin. Domain caches are invalidated afterwards so
//! new entries take effect within one policy TTL at most.

use crate::config::Config;
use crate::policy::PolicyEngine;
use crate::policy::types::{Blocklist, BlocklistMode};
use crate::store::SqliteStore;
use futures::{stream, StreamExt};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};

/// Sent by the admin API to refresh ahead of the schedule.
#[derive(Debug, Clone, Copy)]
pub enum RefreshRequest {
    All,
    One(i64),
}

pub struct BlocklistRefresher {
    config: Config,
    store: SqliteStore,
    engine: Arc<PolicyEngine>,
    client: Client,
}

impl BlocklistRefresher {
    pub fn new(config: Config, store: SqliteStore, engine: Arc<PolicyEngine>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            engine,
            client: Client::builder()
                .user_agent("dns-warden/1.0")
                .build()
                .unwrap(),
        })
    }

    /// Runs the interval timer and drains on-demand requests until the
    /// channel closes.
    pub async fn run(self: Arc<Self>, mut requests: mpsc::Receiver<RefreshRequest>) {
        let mut ticker = tokio::time::interval(refresh_period(self.config.updates.interval_hours));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_all().await;
                }
                req = requests.recv() => {
                    match req {
                        Some(RefreshRequest::All) => self.refresh_all().await,
                        Some(RefreshRequest::One(id)) => {
                            if let Err(e) = self.refresh_one(id).await {
                                error!("Refresh of blocklist {} failed: {}", id, e);
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    pub async fn refresh_all(&self) {
        info!("Refreshing blocklists...");

        let lists = match self.store.list_blocklists().await {
            Ok(lists) => lists,
            Err(e) => {
                error!("Cannot list blocklists for refresh: {}", e);
                return;
            }
        };

        // Paused lists keep their stored rules; the engine just stops
        // enforcing them. Disabled lists are skipped entirely.
        let tasks = lists
            .into_iter()
            .filter(|l| l.enabled)
            .map(|list| async move { self.sync_list(list).await });

        let results: Vec<_> = stream::iter(tasks)
            .buffer_unordered(self.config.updates.concurrent_downloads)
            .collect()
            .await;

        let synced = results.iter().filter(|r| r.is_ok()).count();
        info!("Blocklist refresh complete: {} lists synced", synced);

        self.engine.invalidate_all_domains();
    }

    pub async fn refresh_one(&self, id: i64) -> anyhow::Result<()> {
        let list = self
            .store
            .list_blocklists()
            .await?
            .into_iter()
            .find(|l| l.id == id)
            .ok_or_else(|| anyhow::anyhow!("No blocklist with id {}", id))?;
        if !list.enabled {
            anyhow::bail!("Blocklist {} is disabled", id);
        }
        self.sync_list(list).await?;
        self.engine.invalidate_all_domains();
        Ok(())
    }

    async fn sync_list(&self, list: Blocklist) -> anyhow::Result<()> {
        info!("Fetching blocklist '{}' (ID {}) from {}", list.name, list.id, list.url);

        let domains = self.fetch_and_parse(&list.url).await?;
        if domains.is_empty() {
            // An empty download is more likely an outage than an emptied
            // list; keep the previous rules rather than wiping them.
            warn!("Blocklist '{}' returned no entries, keeping existing rules", list.name);
            return Ok(());
        }

        let count = domains.len();
        let (inserted, removed) = self.store.sync_blocklist_rules(list.id, domains).await?;
        info!(
            "Synced '{}' (ID {}, mode {:?}): {} entries, +{} -{}",
            list.name, list.id, list.mode, count, inserted, removed
        );
        if list.mode == BlocklistMode::Paused {
            info!("Blocklist '{}' is paused; rules stored but not enforced", list.name);
        }
        Ok(())
    }

    async fn fetch_and_parse(&self, url: &str) -> anyhow::Result<HashSet<String>> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let stream = resp
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));
        let reader = StreamReader::new(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut domains = HashSet::new();

        while let Some(line) = lines.next_line().await? {
            if let Some(domain) = parse_line(&line) {
                domains.insert(domain);
            }
        }
        Ok(domains)
    }
}

/// A zero-period interval panics; an hourly floor keeps a misconfigured
/// `interval_hours = 0` from taking the task down.
fn refresh_period(interval_hours: u64) -> Duration {
    Duration::from_secs(interval_hours.max(1) * 3600)
}

/// Accepts plain domain lists and hosts-file format.
fn parse_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    // Hosts format: "0.0.0.0 ads.example.com"
    let domain = if first.parse::<std::net::IpAddr>().is_ok() {
        tokens.next()?
    } else {
        first
    };
    if domain == "localhost" || !domain.contains('.') {
        return None;
    }
    Some(domain.to_lowercase())
}
