use super::{BlocklistStatusMap, RuleStore, StoreError};
use crate::policy::types::{
    Blocklist, BlocklistMode, BlocklistStatus, ClientProfile, DnsRewrite, DomainRules,
    GlobalBlockedApps, Rule, RuleAction, RuleOrigin,
};
use crate::settings::DnsSettings;
use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

const SETTINGS_KEY_DNS: &str = "dns_settings";
const SETTINGS_KEY_APPS: &str = "app_policy";

/// SQLite-backed rule store. Reads and mutations run on the blocking pool;
/// the connection is shared behind a mutex with WAL and a busy timeout.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

struct Inner {
    db_path: String,
    conn: Mutex<Connection>,
}

/// A persisted query log row, as served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct StoredQueryLog {
    pub timestamp: i64,
    pub client_ip: String,
    pub domain: String,
    pub query_type: String,
    pub decision: String,
    pub source: Option<String>,
    pub upstream: Option<String>,
    pub duration_ms: u64,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            inner: Arc::new(Inner {
                db_path: db_path.to_string(),
                conn: Mutex::new(conn),
            }),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.inner.db_path
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.inner.conn.lock().unwrap();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rules (
                domain TEXT PRIMARY KEY,
                action TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'Manual'
            );
            CREATE TABLE IF NOT EXISTS blocklists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                mode TEXT NOT NULL DEFAULT 'active'
            );
            CREATE TABLE IF NOT EXISTS client_profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                ip TEXT NOT NULL UNIQUE,
                use_global_settings INTEGER NOT NULL DEFAULT 1,
                use_global_categories INTEGER NOT NULL DEFAULT 1,
                use_global_apps INTEGER NOT NULL DEFAULT 1,
                assigned_blocklists TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE IF NOT EXISTS rewrites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL UNIQUE,
                target TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS query_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                client_ip TEXT NOT NULL,
                domain TEXT NOT NULL,
                query_type TEXT NOT NULL,
                decision TEXT NOT NULL,
                source TEXT,
                upstream TEXT,
                duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_rules_category ON rules(category);
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON query_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_logs_domain ON query_logs(domain);
            CREATE INDEX IF NOT EXISTS idx_logs_client_ip ON query_logs(client_ip);",
        )?;

        // Migration: early schemas stored rules without a category column.
        let column_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('rules') WHERE name='category'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0)
            > 0;
        if !column_exists {
            info!("Applying migration: adding category column to rules");
            if let Err(e) = conn.execute(
                "ALTER TABLE rules ADD COLUMN category TEXT NOT NULL DEFAULT 'Manual'",
                [],
            ) {
                error!("Failed to add category column: {}", e);
            }
        }

        info!("SQLite database initialized at {}", self.inner.db_path);
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let conn = inner.conn.lock().unwrap();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }

    // ---- Sync read bodies (also used by tests on the blocking side) ----

    fn read_rules_for_domain(conn: &Connection, domain: &str) -> Result<DomainRules, StoreError> {
        let rewrite = conn
            .prepare_cached("SELECT id, domain, target FROM rewrites WHERE domain = ?1")?
            .query_row(params![domain], |row| {
                Ok(DnsRewrite {
                    id: row.get(0)?,
                    domain: row.get(1)?,
                    target: row.get(2)?,
                })
            })
            .optional()?;

        let mut out = DomainRules {
            rewrite,
            ..DomainRules::default()
        };

        let mut stmt =
            conn.prepare_cached("SELECT domain, action, category FROM rules WHERE domain = ?1")?;
        let rows = stmt.query_map(params![domain], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        for row in rows {
            let (domain, action, category) = row?;
            let action = parse_action(&action)
                .ok_or_else(|| StoreError::Corrupt(format!("bad rule action '{}'", action)))?;
            let rule = Rule {
                domain,
                action,
                origin: RuleOrigin::parse(&category),
            };
            if rule.origin.is_manual() {
                out.manual = Some(rule);
            } else {
                out.imported.push(rule);
            }
        }

        Ok(out)
    }

    fn read_blocklist_statuses(conn: &Connection) -> Result<BlocklistStatusMap, StoreError> {
        let mut stmt = conn.prepare_cached("SELECT id, name, enabled, mode FROM blocklists")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut map = FxHashMap::default();
        for row in rows {
            let (id, name, enabled, mode) = row?;
            let mode = parse_mode(&mode)
                .ok_or_else(|| StoreError::Corrupt(format!("bad blocklist mode '{}'", mode)))?;
            map.insert(
                id,
                BlocklistStatus {
                    name,
                    enabled,
                    mode,
                },
            );
        }
        Ok(map)
    }

    fn read_client_profile(
        conn: &Connection,
        ip: IpAddr,
    ) -> Result<Option<ClientProfile>, StoreError> {
        let row = conn
            .prepare_cached(
                "SELECT id, name, ip, use_global_settings, use_global_categories,
                        use_global_apps, assigned_blocklists
                 FROM client_profiles WHERE ip = ?1",
            )?
            .query_row(params![ip.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .optional()?;

        let Some((id, name, ip_str, settings, categories, apps, assigned)) = row else {
            return Ok(None);
        };
        let ip = IpAddr::from_str(&ip_str)
            .map_err(|_| StoreError::Corrupt(format!("bad profile ip '{}'", ip_str)))?;
        let assigned_blocklists: Vec<i64> = serde_json::from_str(&assigned)
            .map_err(|e| StoreError::Corrupt(format!("bad assigned_blocklists: {}", e)))?;

        Ok(Some(ClientProfile {
            id,
            name,
            ip,
            use_global_settings: settings,
            use_global_categories: categories,
            use_global_apps: apps,
            assigned_blocklists,
        }))
    }

    fn read_setting(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
        Ok(conn
            .prepare_cached("SELECT value FROM settings WHERE key = ?1")?
            .query_row(params![key], |row| row.get::<_, String>(0))
            .optional()?)
    }

    fn write_setting(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
        conn.prepare_cached(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )?
        .execute(params![key, value])?;
        Ok(())
    }

    // ---- Admin mutations ----

    /// Inserts a rule. One rule per domain: a conflicting insert is rejected,
    /// not merged.
    pub async fn insert_rule(
        &self,
        domain: String,
        action: RuleAction,
        category: String,
    ) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let domain = domain.to_lowercase();
            let result = conn
                .prepare_cached("INSERT INTO rules (domain, action, category) VALUES (?1, ?2, ?3)")?
                .execute(params![domain, action_str(action), category]);
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(domain)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Returns `true` when a rule existed and was removed.
    pub async fn delete_rule(&self, domain: String) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let n = conn
                .prepare_cached("DELETE FROM rules WHERE domain = ?1")?
                .execute(params![domain.to_lowercase()])?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn list_rules(&self) -> Result<Vec<(String, RuleAction, String)>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT domain, action, category FROM rules ORDER BY domain")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (domain, action, category) = row?;
                let action = parse_action(&action)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad rule action '{}'", action)))?;
                out.push((domain, action, category));
            }
            Ok(out)
        })
        .await
    }

    pub async fn list_blocklists(&self) -> Result<Vec<Blocklist>, StoreError> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT id, name, url, enabled, mode FROM blocklists")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, name, url, enabled, mode) = row?;
                let mode = parse_mode(&mode)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad blocklist mode '{}'", mode)))?;
                out.push(Blocklist {
                    id,
                    name,
                    url,
                    enabled,
                    mode,
                });
            }
            Ok(out)
        })
        .await
    }

    pub async fn create_blocklist(&self, name: String, url: String) -> Result<i64, StoreError> {
        self.blocking(move |conn| {
            conn.prepare_cached("INSERT INTO blocklists (name, url) VALUES (?1, ?2)")?
                .execute(params![name, url])?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn set_blocklist_state(
        &self,
        id: i64,
        enabled: Option<bool>,
        mode: Option<BlocklistMode>,
    ) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let mut changed = 0;
            if let Some(enabled) = enabled {
                changed += conn
                    .prepare_cached("UPDATE blocklists SET enabled = ?1 WHERE id = ?2")?
                    .execute(params![enabled, id])?;
            }
            if let Some(mode) = mode {
                changed += conn
                    .prepare_cached("UPDATE blocklists SET mode = ?1 WHERE id = ?2")?
                    .execute(params![mode_str(mode), id])?;
            }
            Ok(changed > 0)
        })
        .await
    }

    /// Removes a blocklist and every rule it imported.
    pub async fn delete_blocklist(&self, id: i64) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let n = conn
                .prepare_cached("DELETE FROM blocklists WHERE id = ?1")?
                .execute(params![id])?;
            conn.prepare_cached(
                "DELETE FROM rules WHERE category = ?1 OR category LIKE ?2",
            )?
            .execute(params![
                format!("Blocklist:{}", id),
                format!("Blocklist:{}:%", id)
            ])?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn upsert_client_profile(
        &self,
        profile: ClientProfile,
    ) -> Result<i64, StoreError> {
        self.blocking(move |conn| {
            let assigned = serde_json::to_string(&profile.assigned_blocklists)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            conn.prepare_cached(
                "INSERT INTO client_profiles
                    (name, ip, use_global_settings, use_global_categories,
                     use_global_apps, assigned_blocklists)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(ip) DO UPDATE SET
                    name = excluded.name,
                    use_global_settings = excluded.use_global_settings,
                    use_global_categories = excluded.use_global_categories,
                    use_global_apps = excluded.use_global_apps,
                    assigned_blocklists = excluded.assigned_blocklists",
            )?
            .execute(params![
                profile.name,
                profile.ip.to_string(),
                profile.use_global_settings,
                profile.use_global_categories,
                profile.use_global_apps,
                assigned
            ])?;
            conn.prepare_cached("SELECT id FROM client_profiles WHERE ip = ?1")?
                .query_row(params![profile.ip.to_string()], |row| row.get(0))
                .map_err(Into::into)
        })
        .await
    }

    pub async fn list_client_profiles(&self) -> Result<Vec<ClientProfile>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, ip, use_global_settings, use_global_categories,
                        use_global_apps, assigned_blocklists
                 FROM client_profiles ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, name, ip_str, settings, categories, apps, assigned) = row?;
                let ip = IpAddr::from_str(&ip_str)
                    .map_err(|_| StoreError::Corrupt(format!("bad profile ip '{}'", ip_str)))?;
                let assigned_blocklists: Vec<i64> = serde_json::from_str(&assigned)
                    .map_err(|e| StoreError::Corrupt(format!("bad assigned_blocklists: {}", e)))?;
                out.push(ClientProfile {
                    id,
                    name,
                    ip,
                    use_global_settings: settings,
                    use_global_categories: categories,
                    use_global_apps: apps,
                    assigned_blocklists,
                });
            }
            Ok(out)
        })
        .await
    }

    /// Deletes a profile; returns its IP so the caller can invalidate.
    pub async fn delete_client_profile(&self, id: i64) -> Result<Option<IpAddr>, StoreError> {
        self.blocking(move |conn| {
            let ip: Option<String> = conn
                .prepare_cached("SELECT ip FROM client_profiles WHERE id = ?1")?
                .query_row(params![id], |row| row.get(0))
                .optional()?;
            let Some(ip) = ip else { return Ok(None) };
            conn.prepare_cached("DELETE FROM client_profiles WHERE id = ?1")?
                .execute(params![id])?;
            Ok(IpAddr::from_str(&ip).ok())
        })
        .await
    }

    pub async fn set_global_blocked_apps(
        &self,
        apps: GlobalBlockedApps,
    ) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let json =
                serde_json::to_string(&apps).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            Self::write_setting(conn, SETTINGS_KEY_APPS, &json)
        })
        .await
    }

    pub async fn create_rewrite(&self, domain: String, target: String) -> Result<i64, StoreError> {
        self.blocking(move |conn| {
            let domain = domain.to_lowercase();
            let result = conn
                .prepare_cached("INSERT INTO rewrites (domain, target) VALUES (?1, ?2)")?
                .execute(params![domain, target]);
            match result {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(domain)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Deletes a rewrite; returns its domain so the caller can invalidate.
    pub async fn delete_rewrite(&self, id: i64) -> Result<Option<String>, StoreError> {
        self.blocking(move |conn| {
            let domain: Option<String> = conn
                .prepare_cached("SELECT domain FROM rewrites WHERE id = ?1")?
                .query_row(params![id], |row| row.get(0))
                .optional()?;
            if domain.is_some() {
                conn.prepare_cached("DELETE FROM rewrites WHERE id = ?1")?
                    .execute(params![id])?;
            }
            Ok(domain)
        })
        .await
    }

    pub async fn list_rewrites(&self) -> Result<Vec<DnsRewrite>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare_cached("SELECT id, domain, target FROM rewrites")?;
            let rows = stmt.query_map([], |row| {
                Ok(DnsRewrite {
                    id: row.get(0)?,
                    domain: row.get(1)?,
                    target: row.get(2)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    pub async fn write_dns_settings(&self, settings: DnsSettings) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let json =
                serde_json::to_string(&settings).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            Self::write_setting(conn, SETTINGS_KEY_DNS, &json)
        })
        .await
    }

    /// Replaces the imported rules of blocklist `id` with `domains`.
    /// Domains already owned by another rule keep their existing rule (one
    /// rule per domain). Returns (inserted, removed).
    pub async fn sync_blocklist_rules(
        &self,
        id: i64,
        domains: HashSet<String>,
    ) -> Result<(usize, usize), StoreError> {
        self.blocking(move |conn| {
            let category = format!("Blocklist:{}", id);
            let legacy_prefix = format!("Blocklist:{}:%", id);

            let existing: HashSet<String> = {
                let mut stmt = conn.prepare_cached(
                    "SELECT domain FROM rules WHERE category = ?1 OR category LIKE ?2",
                )?;
                let rows = stmt.query_map(params![category, legacy_prefix], |row| row.get(0))?;
                rows.collect::<Result<HashSet<String>, _>>()?
            };

            let mut removed = 0;
            {
                let mut delete = conn.prepare_cached(
                    "DELETE FROM rules WHERE domain = ?1 AND (category = ?2 OR category LIKE ?3)",
                )?;
                for domain in existing.difference(&domains) {
                    removed += delete.execute(params![domain, category, legacy_prefix])?;
                }
            }

            let mut inserted = 0;
            {
                let mut insert = conn.prepare_cached(
                    "INSERT OR IGNORE INTO rules (domain, action, category) VALUES (?1, 'blocked', ?2)",
                )?;
                for domain in domains.difference(&existing) {
                    inserted += insert.execute(params![domain, category])?;
                }
            }

            Ok((inserted, removed))
        })
        .await
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<StoredQueryLog>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT timestamp, client_ip, domain, query_type, decision, source, upstream,
                        duration_ms
                 FROM query_logs ORDER BY timestamp DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(StoredQueryLog {
                    timestamp: row.get(0)?,
                    client_ip: row.get(1)?,
                    domain: row.get(2)?,
                    query_type: row.get(3)?,
                    decision: row.get(4)?,
                    source: row.get(5)?,
                    upstream: row.get(6)?,
                    duration_ms: row.get::<_, i64>(7)? as u64,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }
}

#[async_trait::async_trait]
impl RuleStore for SqliteStore {
    async fn rules_for_domain(&self, domain: &str) -> Result<DomainRules, StoreError> {
        let domain = domain.to_string();
        self.blocking(move |conn| Self::read_rules_for_domain(conn, &domain))
            .await
    }

    async fn blocklist_statuses(&self) -> Result<BlocklistStatusMap, StoreError> {
        self.blocking(Self::read_blocklist_statuses).await
    }

    async fn client_profile(&self, ip: IpAddr) -> Result<Option<ClientProfile>, StoreError> {
        self.blocking(move |conn| Self::read_client_profile(conn, ip))
            .await
    }

    async fn global_blocked_apps(&self) -> Result<GlobalBlockedApps, StoreError> {
        self.blocking(|conn| {
            let Some(json) = Self::read_setting(conn, SETTINGS_KEY_APPS)? else {
                return Ok(GlobalBlockedApps::default());
            };
            serde_json::from_str(&json)
                .map_err(|e| StoreError::Corrupt(format!("bad app policy: {}", e)))
        })
        .await
    }

    async fn dns_settings(&self) -> Result<DnsSettings, StoreError> {
        self.blocking(|conn| {
            Ok(match Self::read_setting(conn, SETTINGS_KEY_DNS)? {
                Some(json) => DnsSettings::from_persisted(&json),
                None => DnsSettings::default(),
            })
        })
        .await
    }
}

fn action_str(action: RuleAction) -> &'static str {
    match action {
        RuleAction::Blocked => "blocked",
        RuleAction::Allowed => "allowed",
    }
}

fn parse_action(s: &str) -> Option<RuleAction> {
    match s {
        "blocked" => Some(RuleAction::Blocked),
        "allowed" => Some(RuleAction::Allowed),
        _ => None,
    }
}

fn mode_str(mode: BlocklistMode) -> &'static str {
    match mode {
        BlocklistMode::Active => "active",
        BlocklistMode::Paused => "paused",
    }
}

fn parse_mode(s: &str) -> Option<BlocklistMode> {
    match s {
        "active" => Some(BlocklistMode::Active),
        "paused" => Some(BlocklistMode::Paused),
        _ => None,
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
