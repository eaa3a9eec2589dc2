use hickory_server::proto::rr::RecordType;
use std::net::IpAddr;
use std::sync::Arc;

/// One record per decided query, handed to the sinks fire-and-forget.
#[derive(Debug, Clone)]
pub struct QueryLogEntry {
    pub client_ip: IpAddr,
    pub domain: Arc<str>,
    pub query_type: RecordType,
    pub outcome: QueryOutcome,
    /// Policy source label (`manual`, `blocklist:<id>`, `rewrite:<target>`...).
    pub source: Option<String>,
    /// Upstream label, or `cache` when served from the response cache.
    pub upstream: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Allowed,
    Blocked,
    Rewritten,
    Failed,
}

impl QueryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOutcome::Allowed => "allowed",
            QueryOutcome::Blocked => "blocked",
            QueryOutcome::Rewritten => "rewritten",
            QueryOutcome::Failed => "failed",
        }
    }
}

pub trait QueryLogSink: Send + Sync {
    fn log(&self, entry: &QueryLogEntry);
}
