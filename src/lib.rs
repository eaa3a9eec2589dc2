pub mod admin;
pub mod api;
pub mod config;
pub mod init;
pub mod logger;
pub mod policy;
pub mod refresh;
pub mod server;
pub mod settings;
pub mod stats;
pub mod store;
pub mod upstream;
