//! Policy data model.
//!
//! Rule provenance is encoded in the store as a free-text category column
//! (`Manual`, `Blocklist:<id>`, `Category:<name>`, `App:<name>`). It is
//! parsed exactly once, at store-read time, into [`RuleOrigin`]; nothing
//! past the store layer touches the raw string again.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Blocked,
    Allowed,
}

/// Where a rule came from, parsed from the category column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOrigin {
    /// Free-form admin tag, "Manual" by default.
    Manual(String),
    /// Imported by the refresh job for blocklist `id`. Kept as the raw id
    /// string; an id that does not resolve to a known blocklist never
    /// enforces.
    Blocklist(String),
    /// Category tag enforced via the client's `use_global_categories` flag.
    Category(String),
    /// App tag enforced via the global app policy.
    App(String),
}

impl RuleOrigin {
    /// Parses a raw category string. Prefix matching is case-sensitive and
    /// colon-delimited; anything unrecognized is a manual tag.
    pub fn parse(category: &str) -> Self {
        if let Some(id) = extract_blocklist_id(category) {
            return RuleOrigin::Blocklist(id.to_string());
        }
        if let Some(name) = category.strip_prefix("Category:") {
            return RuleOrigin::Category(name.to_string());
        }
        if let Some(name) = category.strip_prefix("App:") {
            return RuleOrigin::App(name.to_string());
        }
        RuleOrigin::Manual(category.to_string())
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, RuleOrigin::Manual(_))
    }
}

/// Extracts the blocklist id from `Blocklist:<id>` or the legacy
/// `Blocklist:<id>:<name>` form. Returns `None` for anything else.
pub fn extract_blocklist_id(category: &str) -> Option<&str> {
    let rest = category.strip_prefix("Blocklist:")?;
    match rest.find(':') {
        Some(idx) => Some(&rest[..idx]),
        None => Some(rest),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub domain: String,
    pub action: RuleAction,
    pub origin: RuleOrigin,
}

/// One keyed read shape: everything the engine needs to know about a domain.
#[derive(Debug, Clone, Default)]
pub struct DomainRules {
    pub rewrite: Option<DnsRewrite>,
    pub manual: Option<Rule>,
    pub imported: Vec<Rule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlocklistMode {
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize)]
pub struct Blocklist {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub mode: BlocklistMode,
}

/// The subset of [`Blocklist`] the decision engine gates on.
#[derive(Debug, Clone)]
pub struct BlocklistStatus {
    pub name: String,
    pub enabled: bool,
    pub mode: BlocklistMode,
}

impl BlocklistStatus {
    pub fn is_enforcing(&self) -> bool {
        self.enabled && self.mode == BlocklistMode::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub id: i64,
    pub name: String,
    pub ip: IpAddr,
    pub use_global_settings: bool,
    pub use_global_categories: bool,
    pub use_global_apps: bool,
    /// Empty means the profile follows the global blocklist set.
    pub assigned_blocklists: Vec<i64>,
}

impl ClientProfile {
    /// Whether blocklist `id` applies to this client.
    pub fn blocklist_applies(&self, id: i64) -> bool {
        self.assigned_blocklists.is_empty() || self.assigned_blocklists.contains(&id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalBlockedApps {
    pub blocked_apps: Vec<String>,
    /// Monitor-only apps: matching queries are allowed but tagged in the log.
    pub shadow_apps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRewrite {
    pub id: i64,
    pub domain: String,
    /// An IP literal (synthesized answer) or a domain alias (re-resolved).
    pub target: String,
}

/// Outcome of policy evaluation for one (domain, client) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed(AllowReason),
    Blocked(BlockSource),
    Rewritten { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowReason {
    /// No rule matched.
    Default,
    /// A manual ALLOWED rule overrode everything below it.
    ManualRule,
    /// An app rule matched but the app is shadow-listed (monitor only).
    ShadowApp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSource {
    ManualRule,
    Blocklist { id: i64, name: String },
    Category(String),
    App(String),
}

impl Verdict {
    /// Short label for query logs and stats.
    pub fn source_label(&self) -> String {
        match self {
            Verdict::Allowed(AllowReason::Default) => "default".to_string(),
            Verdict::Allowed(AllowReason::ManualRule) => "manual".to_string(),
            Verdict::Allowed(AllowReason::ShadowApp(app)) => format!("shadow-app:{}", app),
            Verdict::Blocked(BlockSource::ManualRule) => "manual".to_string(),
            Verdict::Blocked(BlockSource::Blocklist { id, .. }) => format!("blocklist:{}", id),
            Verdict::Blocked(BlockSource::Category(name)) => format!("category:{}", name),
            Verdict::Blocked(BlockSource::App(name)) => format!("app:{}", name),
            Verdict::Rewritten { target } => format!("rewrite:{}", target),
        }
    }
}
