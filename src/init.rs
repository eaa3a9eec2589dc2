//! Initialization helpers for the application startup.

use crate::config::Config;
use crate::store::SqliteStore;
use anyhow::Context;

/// Sets up the tracing subscriber with the configured filters.
pub fn setup_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = config.logging.level.clone();

        // Suppress hickory logs unless explicitly enabled/overridden
        if !filter.contains("hickory_server") {
            filter.push_str(",hickory_server=off");
        }
        if !filter.contains("hickory_proto") {
            filter.push_str(",hickory_proto=off");
        }
        if !filter.contains("hickory_resolver") {
            filter.push_str(",hickory_resolver=off");
        }

        tracing_subscriber::EnvFilter::new(filter)
    });

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Opens the rule store and creates the schema if missing.
pub fn init_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let store = SqliteStore::new(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path))?;
    store.initialize().context("Failed to initialize schema")?;
    Ok(store)
}
