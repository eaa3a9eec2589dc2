//! SQLite query log sink. Owns its connection on a dedicated thread so the
//! async side never touches the database; the schema is created by
//! `SqliteStore::initialize` before any sink starts.

use crate::logger::types::{QueryLogEntry, QueryLogSink};
use rusqlite::{params, Connection};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Backpressure bound toward the writer thread; a full buffer drops the
/// entry instead of growing the queue while the writer is stalled.
const WRITE_BUFFER: usize = 1000;

pub struct SqliteLogSink {
    tx: SyncSender<QueryLogEntry>,
}

struct LogWriter {
    conn: Connection,
}

impl SqliteLogSink {
    pub fn new(db_path: &str, retention_hours: u64) -> Result<Self, rusqlite::Error> {
        let writer = LogWriter::new(db_path)?;
        let (tx, rx) = mpsc::sync_channel::<QueryLogEntry>(WRITE_BUFFER);

        thread::spawn(move || {
            run_writer(writer, retention_hours, rx);
        });

        Ok(Self { tx })
    }
}

impl QueryLogSink for SqliteLogSink {
    fn log(&self, entry: &QueryLogEntry) {
        if let Err(e) = self.tx.try_send(entry.clone()) {
            warn!("Dropping query log entry for SQLite sink: {}", e);
        }
    }
}

impl LogWriter {
    fn new(db_path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    fn insert(&mut self, entry: &QueryLogEntry) -> Result<(), rusqlite::Error> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO query_logs (
                timestamp, client_ip, domain, query_type, decision, source,
                upstream, duration_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.execute(params![
            timestamp,
            entry.client_ip.to_string(),
            &*entry.domain,
            entry.query_type.to_string(),
            entry.outcome.as_str(),
            entry.source,
            entry.upstream,
            entry.duration_ms as i64,
        ])?;
        Ok(())
    }

    fn prune(&mut self, retention_hours: u64) -> Result<(), rusqlite::Error> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let cutoff = now - (retention_hours * 3600) as i64;
        self.conn
            .prepare_cached("DELETE FROM query_logs WHERE timestamp < ?1")?
            .execute(params![cutoff])?;
        Ok(())
    }
}

fn run_writer(mut writer: LogWriter, retention_hours: u64, rx: Receiver<QueryLogEntry>) {
    let mut last_cleanup = SystemTime::now();

    while let Ok(entry) = rx.recv() {
        if let Err(e) = writer.insert(&entry) {
            error!("Failed to insert query log entry: {}", e);
        }

        if last_cleanup.elapsed().unwrap_or_default() > Duration::from_secs(3600) {
            if let Err(e) = writer.prune(retention_hours) {
                error!("Failed to prune old query logs: {}", e);
            }
            last_cleanup = SystemTime::now();
        }
    }

    info!("SQLite query log writer stopping.");
}
