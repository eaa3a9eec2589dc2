//! Upstream transport selector.
//!
//! Builds exactly one resolver from the active [`DnsSettings`]: either the
//! loopback recursive resolver (`unbound` mode) or a forwarder over
//! UDP, TCP, DNS-over-TLS, or DNS-over-HTTPS. Settings are validated at
//! write time, so construction here only fails on environmental problems
//! (bootstrap failure, unparseable loopback address).

pub mod types;

pub use self::types::{Upstream, UpstreamError};

use crate::config::UpstreamConfig;
use crate::settings::{DnsSettings, ForwardSettings, ForwardTransport, UpstreamMode};
use anyhow::{Context, Result};
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::lookup_ip::LookupIp;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{Record, RecordType};
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

struct ForwardUpstream {
    label: String,
    resolver: TokioResolver,
    timeout: Duration,
}

#[async_trait::async_trait]
impl Upstream for ForwardUpstream {
    async fn resolve(&self, name: &str, qtype: RecordType) -> Result<Vec<Record>, UpstreamError> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.lookup(name, qtype))
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))?;
        match lookup {
            Ok(lookup) => Ok(lookup.records().to_vec()),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("timed out") {
                    Err(UpstreamError::Timeout(self.timeout))
                } else {
                    Err(UpstreamError::Unreachable(msg))
                }
            }
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Builds the upstream for the given settings. Called at startup and again
/// whenever the admin writes new settings or the periodic settings poll sees
/// a change.
pub async fn build_upstream(
    settings: &DnsSettings,
    config: &UpstreamConfig,
) -> Result<Arc<dyn Upstream>> {
    let timeout = Duration::from_millis(config.timeout_ms);

    let (label, socket_addr, protocol, tls_dns_name, http_endpoint) =
        match (&settings.upstream_mode, &settings.forward) {
            (UpstreamMode::Unbound, _) => {
                let addr: SocketAddr = config
                    .unbound_addr
                    .parse()
                    .with_context(|| format!("bad unbound_addr '{}'", config.unbound_addr))?;
                (format!("unbound://{}", addr), addr, Protocol::Udp, None, None)
            }
            (UpstreamMode::Forward, Some(forward)) => forward_target(forward, config).await?,
            (UpstreamMode::Forward, None) => {
                // Normalization guarantees a forward block; a missing one can
                // only mean the settings bypassed validation.
                anyhow::bail!("forward mode without forward settings")
            }
        };

    let mut ns_cfg = NameServerConfig::new(socket_addr, protocol);
    if matches!(protocol, Protocol::Tls | Protocol::Https) {
        ns_cfg.tls_dns_name = tls_dns_name;
    }
    if protocol == Protocol::Https {
        ns_cfg.http_endpoint = http_endpoint;
    }

    let mut resolver_config = ResolverConfig::new();
    resolver_config.add_name_server(ns_cfg);

    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;
    opts.timeout = timeout;

    let resolver =
        Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();

    info!("Upstream selected: {} ({})", label, socket_addr);

    Ok(Arc::new(ForwardUpstream {
        label,
        resolver,
        timeout,
    }))
}

type Target = (String, SocketAddr, Protocol, Option<String>, Option<String>);

async fn forward_target(forward: &ForwardSettings, config: &UpstreamConfig) -> Result<Target> {
    match forward.transport {
        ForwardTransport::Doh => {
            let doh_url = forward
                .doh_url
                .as_deref()
                .context("doh transport without doh_url")?;
            let url = Url::parse(doh_url).context("Failed to parse doh_url")?;
            let host = url.host_str().context("doh_url has no host")?.to_string();
            let port = url.port().unwrap_or(443);
            let addr = bootstrap_host(config, &host, port).await?;
            Ok((
                format!("doh://{}", doh_url.trim_start_matches("https://")),
                addr,
                Protocol::Https,
                Some(host),
                Some(url.path().to_string()),
            ))
        }
        transport => {
            let host = forward
                .host
                .as_deref()
                .context("forward transport without host")?;
            let port = forward.port.context("forward transport without port")?;
            let addr = bootstrap_host(config, host, port).await?;
            let (scheme, protocol, tls_name) = match transport {
                ForwardTransport::Udp => ("udp", Protocol::Udp, None),
                ForwardTransport::Tcp => ("tcp", Protocol::Tcp, None),
                ForwardTransport::Dot => ("dot", Protocol::Tls, Some(host.to_string())),
                ForwardTransport::Doh => unreachable!(),
            };
            Ok((
                format!("{}://{}:{}", scheme, host, port),
                addr,
                protocol,
                tls_name,
                None,
            ))
        }
    }
}

/// Resolves a non-IP upstream host with the configured bootstrap resolvers.
async fn bootstrap_host(config: &UpstreamConfig, host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = host.parse() {
        return Ok(SocketAddr::new(addr, port));
    }

    let bootstrap_config = if config.bootstrap_dns.is_empty() {
        ResolverConfig::google()
    } else {
        let mut cfg = ResolverConfig::new();
        for ip in &config.bootstrap_dns {
            if let Ok(sa) = ip.parse::<SocketAddr>() {
                cfg.add_name_server(NameServerConfig::new(sa, Protocol::Udp));
            }
        }
        cfg
    };

    let bootstrap =
        Resolver::builder_with_config(bootstrap_config, TokioConnectionProvider::default())
            .build();

    info!("Bootstrapping upstream host: {}", host);
    let lookup: LookupIp = bootstrap.lookup_ip(host).await?;
    let ip = lookup
        .into_iter()
        .next()
        .context("No IP found for bootstrap host")?;

    Ok(SocketAddr::new(ip, port))
}
