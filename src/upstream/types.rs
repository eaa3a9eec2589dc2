use hickory_resolver::proto::rr::{Record, RecordType};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
}

/// Uniform resolve contract over the configured transport. The pipeline does
/// not retry within a query; a failure becomes SERVFAIL.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    async fn resolve(&self, name: &str, qtype: RecordType) -> Result<Vec<Record>, UpstreamError>;

    /// Human-readable target for logs, e.g. `dot://1.1.1.1:853`.
    fn label(&self) -> &str;
}
