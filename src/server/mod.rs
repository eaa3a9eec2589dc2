mod handler;
mod types;

pub use handler::DnsHandler;
pub use types::QueryContext;
