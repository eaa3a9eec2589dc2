pub mod cache;
pub mod engine;
pub mod types;

pub use cache::CoalescingCache;
pub use engine::PolicyEngine;
pub use types::{
    extract_blocklist_id, AllowReason, BlockSource, Blocklist, BlocklistMode, BlocklistStatus,
    ClientProfile, DnsRewrite, DomainRules, GlobalBlockedApps, Rule, RuleAction, RuleOrigin,
    Verdict,
};
