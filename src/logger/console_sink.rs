use crate::config::LoggingConfig;
use crate::logger::types::{QueryLogEntry, QueryLogSink, QueryOutcome};
use tracing::info;

pub struct ConsoleLogSink {
    config: LoggingConfig,
}

impl ConsoleLogSink {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }
}

impl QueryLogSink for ConsoleLogSink {
    fn log(&self, entry: &QueryLogEntry) {
        if !self.config.enable {
            return;
        }

        let should_log = match entry.outcome {
            QueryOutcome::Blocked => self.config.log_blocked,
            _ => self.config.log_all_queries,
        };
        if !should_log {
            return;
        }

        if self.config.format == "json" {
            info!(
                target: "dns_query",
                client = %entry.client_ip,
                domain = %entry.domain,
                r#type = %entry.query_type,
                decision = entry.outcome.as_str(),
                source = ?entry.source,
                upstream = ?entry.upstream,
                ms = entry.duration_ms,
            );
        } else {
            let detail = match entry.outcome {
                QueryOutcome::Blocked => {
                    format!("blocked by {}", entry.source.as_deref().unwrap_or("policy"))
                }
                QueryOutcome::Rewritten => {
                    format!("rewritten ({})", entry.source.as_deref().unwrap_or("rewrite"))
                }
                QueryOutcome::Allowed => match entry.upstream.as_deref() {
                    Some(up) => format!("resolved via {}", up),
                    None => "allowed".to_string(),
                },
                QueryOutcome::Failed => "resolution failed".to_string(),
            };

            info!(
                "[{}] {} {} -> {} [{}ms]",
                entry.query_type, entry.client_ip, entry.domain, detail, entry.duration_ms
            );
        }
    }
}
