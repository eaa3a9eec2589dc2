//! Query logging: one record per decided query, fanned out to the configured
//! sinks over bounded channels. Delivery never blocks the response path; a
//! full channel drops the entry.

pub mod console_sink;
pub mod sqlite_sink;
pub mod types;

pub use self::console_sink::ConsoleLogSink;
pub use self::sqlite_sink::SqliteLogSink;
pub use self::types::{QueryLogEntry, QueryLogSink, QueryOutcome};

use crate::config::LoggingConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

const SINK_BUFFER: usize = 1000;

pub struct QueryLogger {
    sinks: Vec<mpsc::Sender<QueryLogEntry>>,
}

impl QueryLogger {
    pub fn new(config: LoggingConfig, db_path: &str) -> Arc<Self> {
        let mut boxed: Vec<Box<dyn QueryLogSink>> = Vec::new();
        for sink_type in &config.query_log_sinks {
            match sink_type.as_str() {
                "console" => boxed.push(Box::new(ConsoleLogSink::new(config.clone()))),
                "sqlite" => match SqliteLogSink::new(db_path, config.sqlite_retention_hours) {
                    Ok(sink) => boxed.push(Box::new(sink)),
                    Err(e) => warn!("Failed to open SQLite log sink: {}", e),
                },
                other => warn!("Unknown log sink type: {}", other),
            }
        }
        Self::with_sinks(boxed)
    }

    /// Wires each sink behind its own bounded channel and drain task.
    pub fn with_sinks(sinks: Vec<Box<dyn QueryLogSink>>) -> Arc<Self> {
        let mut senders = Vec::new();
        for sink in sinks {
            let (tx, mut rx) = mpsc::channel::<QueryLogEntry>(SINK_BUFFER);
            tokio::spawn(async move {
                while let Some(entry) = rx.recv().await {
                    sink.log(&entry);
                }
            });
            senders.push(tx);
        }
        Arc::new(Self { sinks: senders })
    }

    /// Fire-and-forget; drops on overflow rather than queueing unboundedly.
    pub fn log(&self, entry: QueryLogEntry) {
        let len = self.sinks.len();
        for (i, sink) in self.sinks.iter().enumerate() {
            if i == len - 1 {
                let _ = sink.try_send(entry);
                break;
            }
            let _ = sink.try_send(entry.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_server::proto::rr::RecordType;
    use std::sync::Mutex;
    use std::time::Duration;

    struct TestLogSink {
        logs: Arc<Mutex<Vec<QueryLogEntry>>>,
    }

    impl QueryLogSink for TestLogSink {
        fn log(&self, entry: &QueryLogEntry) {
            self.logs.lock().unwrap().push(entry.clone());
        }
    }

    #[tokio::test]
    async fn test_entries_reach_sink() {
        let logs = Arc::new(Mutex::new(Vec::new()));
        let logger = QueryLogger::with_sinks(vec![Box::new(TestLogSink { logs: logs.clone() })]);

        logger.log(QueryLogEntry {
            client_ip: "10.0.0.2".parse().unwrap(),
            domain: "example.com".into(),
            query_type: RecordType::A,
            outcome: QueryOutcome::Blocked,
            source: Some("blocklist:1".to_string()),
            upstream: None,
            duration_ms: 0,
        });

        // Drain task runs asynchronously.
        for _ in 0..50 {
            if !logs.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, QueryOutcome::Blocked);
        assert_eq!(logs[0].source.as_deref(), Some("blocklist:1"));
    }
}
