//! The query pipeline: parse -> decide -> resolve/block/rewrite -> log.
//!
//! Per query: RECEIVED -> DECIDED -> {RESOLVING -> ANSWERED} |
//! BLOCKED_RESPONSE | REWRITE_RESPONSE -> LOGGED. Only RESOLVING performs
//! network I/O; everything else runs in memory against warm caches.

use crate::config::Config;
use crate::logger::{QueryLogEntry, QueryLogger, QueryOutcome};
use crate::policy::{PolicyEngine, Verdict};
use crate::stats::StatsCollector;
use crate::upstream::Upstream;
use arc_swap::ArcSwap;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use moka::future::Cache;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use super::types::QueryContext;

const BLOCKED_TTL: u32 = 60;
const REWRITE_TTL: u32 = 300;

#[derive(Clone)]
pub struct DnsHandler {
    config: Config,
    stats: Arc<StatsCollector>,
    logger: Arc<QueryLogger>,
    engine: Arc<PolicyEngine>,
    /// Hot-swapped when the admin writes new DNS settings.
    upstream: Arc<ArcSwap<Arc<dyn Upstream>>>,
    /// Upstream answers, keyed by (name, qtype), with a stale grace window.
    #[allow(clippy::type_complexity)]
    cache: Cache<(Arc<str>, RecordType), (Arc<Vec<Record>>, Instant, Instant)>,
}

impl DnsHandler {
    pub fn new(
        config: Config,
        stats: Arc<StatsCollector>,
        logger: Arc<QueryLogger>,
        engine: Arc<PolicyEngine>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let cache = Cache::builder().max_capacity(config.cache.capacity).build();
        Self {
            config,
            stats,
            logger,
            engine,
            upstream: Arc::new(ArcSwap::new(Arc::new(upstream))),
            cache,
        }
    }

    /// Swaps the active upstream. Called by the settings watcher.
    pub fn set_upstream(&self, upstream: Arc<dyn Upstream>) {
        self.upstream.store(Arc::new(upstream));
    }

    fn query_context(request: &Request) -> Option<QueryContext> {
        let query = request.queries().first()?;
        let mut name = query.name().to_string();
        if name.ends_with('.') {
            name.pop();
        }
        name.make_ascii_lowercase();
        Some(QueryContext {
            name: name.into(),
            qtype: query.query_type(),
            start: Instant::now(),
        })
    }

    async fn resolve_and_cache(
        &self,
        name: &str,
        qtype: RecordType,
    ) -> Result<(Arc<Vec<Record>>, String), crate::upstream::UpstreamError> {
        let upstream = self.upstream.load_full();
        let start = Instant::now();
        let records = upstream.resolve(name, qtype).await?;
        self.stats
            .record_upstream_latency(start.elapsed().as_millis() as u64);
        let records = Arc::new(records);

        if self.config.cache.enable && !records.is_empty() {
            let record_min_ttl = records.iter().map(|r| r.ttl()).min().unwrap_or(300);
            let effective_ttl = std::cmp::max(record_min_ttl, self.config.cache.min_ttl);

            let valid_until = Instant::now() + Duration::from_secs(effective_ttl as u64);
            let stale_until = valid_until + Duration::from_secs(self.config.cache.grace_period_sec);
            self.cache
                .insert(
                    (Arc::from(name), qtype),
                    (records.clone(), valid_until, stale_until),
                )
                .await;
        }

        Ok((records, upstream.label().to_string()))
    }

    async fn check_cache(&self, name: Arc<str>, qtype: RecordType) -> Option<(Arc<Vec<Record>>, bool)> {
        let (records, valid_until, stale_until) = self.cache.get(&(name, qtype)).await?;
        let now = Instant::now();
        if now < valid_until {
            Some((records, false))
        } else if now < stale_until {
            Some((records, true))
        } else {
            None
        }
    }

    fn log_query(
        &self,
        client_ip: IpAddr,
        ctx: &QueryContext,
        outcome: QueryOutcome,
        source: Option<String>,
        upstream: Option<String>,
    ) {
        if !self.config.logging.enable {
            return;
        }
        self.logger.log(QueryLogEntry {
            client_ip,
            domain: ctx.name.clone(),
            query_type: ctx.qtype,
            outcome,
            source,
            upstream,
            duration_ms: ctx.start.elapsed().as_millis() as u64,
        });
    }

    async fn send_records<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        records: &[Record],
        code: ResponseCode,
    ) -> ResponseInfo {
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(false);
        header.set_response_code(code);
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(header, records.iter(), &[], &[], &[]);
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to send response: {}", e);
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }

    async fn serve_blocked<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        ctx: &QueryContext,
        source: String,
    ) -> ResponseInfo {
        self.stats.inc_blocked();

        // A/AAAA get the null address; other types get NXDOMAIN.
        let record = match ctx.qtype {
            RecordType::A => Some(Record::from_rdata(
                Name::from_str(&ctx.name).unwrap_or_default(),
                BLOCKED_TTL,
                RData::A(A::new(0, 0, 0, 0)),
            )),
            RecordType::AAAA => Some(Record::from_rdata(
                Name::from_str(&ctx.name).unwrap_or_default(),
                BLOCKED_TTL,
                RData::AAAA(AAAA::new(0, 0, 0, 0, 0, 0, 0, 0)),
            )),
            _ => None,
        };

        let info = match &record {
            Some(record) => {
                self.send_records(
                    request,
                    response_handle,
                    std::slice::from_ref(record),
                    ResponseCode::NoError,
                )
                .await
            }
            None => {
                self.send_records(request, response_handle, &[], ResponseCode::NXDomain)
                    .await
            }
        };

        self.log_query(
            request.src().ip(),
            ctx,
            QueryOutcome::Blocked,
            Some(source),
            None,
        );
        info
    }

    async fn serve_rewrite<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        ctx: &QueryContext,
        target: String,
    ) -> ResponseInfo {
        self.stats.inc_rewritten();
        let source = format!("rewrite:{}", target);

        // IP target: synthesize the answer. Domain target: resolve the alias
        // upstream and rename the records to the queried name.
        if let Ok(ip) = target.parse::<IpAddr>() {
            let name = Name::from_str(&ctx.name).unwrap_or_default();
            let record = match (ctx.qtype, ip) {
                (RecordType::A, IpAddr::V4(v4)) => {
                    Some(Record::from_rdata(name, REWRITE_TTL, RData::A(A(v4))))
                }
                (RecordType::AAAA, IpAddr::V6(v6)) => {
                    Some(Record::from_rdata(name, REWRITE_TTL, RData::AAAA(AAAA(v6))))
                }
                // Type mismatch: answer NODATA rather than leaking upstream.
                _ => None,
            };
            let records: Vec<Record> = record.into_iter().collect();
            let info = self
                .send_records(request, response_handle, &records, ResponseCode::NoError)
                .await;
            self.log_query(
                request.src().ip(),
                ctx,
                QueryOutcome::Rewritten,
                Some(source),
                None,
            );
            return info;
        }

        match self.resolve_and_cache(&target.to_lowercase(), ctx.qtype).await {
            Ok((records, upstream_name)) => {
                let name = Name::from_str(&ctx.name).unwrap_or_default();
                let renamed: Vec<Record> = records
                    .iter()
                    .cloned()
                    .map(|mut r| {
                        r.set_name(name.clone());
                        r
                    })
                    .collect();
                let info = self
                    .send_records(request, response_handle, &renamed, ResponseCode::NoError)
                    .await;
                self.log_query(
                    request.src().ip(),
                    ctx,
                    QueryOutcome::Rewritten,
                    Some(source),
                    Some(upstream_name),
                );
                info
            }
            Err(e) => {
                error!("Rewrite target {} failed for {}: {}", target, ctx.name, e);
                self.serve_failure(request, response_handle, ctx, Some(source))
                    .await
            }
        }
    }

    async fn serve_failure<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        ctx: &QueryContext,
        source: Option<String>,
    ) -> ResponseInfo {
        self.stats.inc_failed();
        let info = self
            .send_records(request, response_handle, &[], ResponseCode::ServFail)
            .await;
        self.log_query(request.src().ip(), ctx, QueryOutcome::Failed, source, None);
        info
    }

    async fn serve_allowed<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        ctx: &QueryContext,
        source: String,
    ) -> ResponseInfo {
        // Response cache first, with stale-while-revalidate.
        if let Some((records, is_stale)) = self.check_cache(ctx.name.clone(), ctx.qtype).await {
            self.stats.inc_cache_hit();
            if is_stale {
                let handler = self.clone();
                let name = ctx.name.clone();
                let qtype = ctx.qtype;
                tokio::spawn(async move {
                    if let Err(e) = handler.resolve_and_cache(&name, qtype).await {
                        error!("Background re-resolve failed for {}: {}", name, e);
                    }
                });
            }
            let info = self
                .send_records(request, response_handle, &records, ResponseCode::NoError)
                .await;
            self.log_query(
                request.src().ip(),
                ctx,
                QueryOutcome::Allowed,
                Some(source),
                Some("cache".to_string()),
            );
            return info;
        }

        match self.resolve_and_cache(&ctx.name, ctx.qtype).await {
            Ok((records, upstream_name)) => {
                let info = self
                    .send_records(request, response_handle, &records, ResponseCode::NoError)
                    .await;
                self.log_query(
                    request.src().ip(),
                    ctx,
                    QueryOutcome::Allowed,
                    Some(source),
                    Some(upstream_name),
                );
                info
            }
            Err(e) => {
                // No synchronous retry; the client gets SERVFAIL.
                error!("Upstream resolution failed for {}: {}", ctx.name, e);
                self.serve_failure(request, response_handle, ctx, Some(source))
                    .await
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for DnsHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        self.stats.inc_queries();

        // Malformed / empty questions never reach the decision engine.
        let Some(ctx) = Self::query_context(request) else {
            return self
                .send_records(request, &mut response_handle, &[], ResponseCode::FormErr)
                .await;
        };

        let client_ip = request.src().ip();

        match self.engine.decide(&ctx.name, client_ip).await {
            Ok(Verdict::Rewritten { target }) => {
                self.serve_rewrite(request, &mut response_handle, &ctx, target)
                    .await
            }
            Ok(verdict @ Verdict::Blocked(_)) => {
                self.serve_blocked(request, &mut response_handle, &ctx, verdict.source_label())
                    .await
            }
            Ok(verdict @ Verdict::Allowed(_)) => {
                self.serve_allowed(request, &mut response_handle, &ctx, verdict.source_label())
                    .await
            }
            Err(e) if self.config.policy.fail_open => {
                // Explicit fail-open: resolve rather than deny the LAN while
                // the store is down.
                warn!("Policy store unavailable ({}), failing open for {}", e, ctx.name);
                self.serve_allowed(
                    request,
                    &mut response_handle,
                    &ctx,
                    "fail-open".to_string(),
                )
                .await
            }
            Err(e) => {
                warn!("Policy store unavailable ({}), failing closed for {}", e, ctx.name);
                self.serve_failure(request, &mut response_handle, &ctx, None)
                    .await
            }
        }
    }
}
