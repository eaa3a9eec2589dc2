//! Upstream DNS settings: one canonical typed structure plus the
//! normalization that maps any persisted or submitted shape onto it.
//!
//! Validation happens at write time. By the time the transport selector
//! reads a [`DnsSettings`], every field it needs is present and in range.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_DOH_URL: &str = "https://cloudflare-dns.com/dns-query";
pub const DEFAULT_DOT_PORT: u16 = 853;
pub const DEFAULT_PLAIN_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// Hand off to the local recursive resolver over loopback.
    Unbound,
    /// Forward to a configured remote resolver.
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardTransport {
    Udp,
    Tcp,
    Dot,
    Doh,
}

/// Normalized forward target. For `doh` only `doh_url` is set; for the other
/// transports `host` and `port` are always set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSettings {
    pub transport: ForwardTransport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doh_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    pub upstream_mode: UpstreamMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardSettings>,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            upstream_mode: UpstreamMode::Unbound,
            forward: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("invalid upstream config: unknown upstream mode '{0}'")]
    UnknownMode(String),
    #[error("invalid upstream config: unknown transport '{0}'")]
    UnknownTransport(String),
    #[error("invalid upstream config: forward block required when upstream_mode = forward")]
    MissingForward,
    #[error("invalid upstream config: host required for transport '{0}'")]
    MissingHost(String),
    #[error("invalid upstream config: doh_url required for doh transport")]
    MissingDohUrl,
    #[error("invalid upstream config: doh_url must be an https URL, got '{0}'")]
    InvalidDohUrl(String),
}

/// Any shape a settings write or persisted blob may arrive in, including the
/// legacy flat form that predates the nested `forward` block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDnsSettings {
    #[serde(default)]
    pub upstream_mode: Option<String>,
    #[serde(default)]
    pub forward: Option<RawForward>,

    // Legacy flat fields; honored only when no `forward` block is present.
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub doh_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawForward {
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    /// Wider than u16 on purpose: out-of-range writes are clamped, not
    /// rejected.
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub doh_url: Option<String>,
}

impl RawDnsSettings {
    /// Strict normalization used on the settings write path. Rejects
    /// anything the transport selector could not act on.
    pub fn normalize(self) -> Result<DnsSettings, SettingsError> {
        self.normalize_inner(false)
    }

    fn normalize_inner(self, lenient: bool) -> Result<DnsSettings, SettingsError> {
        let mode = match self.upstream_mode.as_deref() {
            None | Some("unbound") => UpstreamMode::Unbound,
            Some("forward") => UpstreamMode::Forward,
            Some(other) => return Err(SettingsError::UnknownMode(other.to_string())),
        };

        if mode == UpstreamMode::Unbound {
            return Ok(DnsSettings {
                upstream_mode: mode,
                forward: None,
            });
        }

        // Legacy migration branch: a flat transport field stands in for the
        // nested forward block.
        let raw_forward = match (self.forward, self.transport.clone()) {
            (Some(f), _) => f,
            (None, Some(transport)) => RawForward {
                transport: Some(transport),
                host: self.host,
                port: self.port,
                doh_url: self.doh_url,
            },
            (None, None) => return Err(SettingsError::MissingForward),
        };

        let transport = match raw_forward.transport.as_deref() {
            None | Some("udp") => ForwardTransport::Udp,
            Some("tcp") => ForwardTransport::Tcp,
            Some("dot") | Some("tls") => ForwardTransport::Dot,
            Some("doh") | Some("https") => ForwardTransport::Doh,
            Some(other) => return Err(SettingsError::UnknownTransport(other.to_string())),
        };

        let forward = if transport == ForwardTransport::Doh {
            let doh_url = match raw_forward.doh_url {
                Some(url) => {
                    if !url.starts_with("https://") {
                        return Err(SettingsError::InvalidDohUrl(url));
                    }
                    url
                }
                None if lenient => DEFAULT_DOH_URL.to_string(),
                None => return Err(SettingsError::MissingDohUrl),
            };
            ForwardSettings {
                transport,
                host: None,
                port: None,
                doh_url: Some(doh_url),
            }
        } else {
            let host = raw_forward
                .host
                .filter(|h| !h.is_empty())
                .ok_or_else(|| SettingsError::MissingHost(format!("{:?}", transport)))?;
            let default_port = match transport {
                ForwardTransport::Dot => DEFAULT_DOT_PORT,
                _ => DEFAULT_PLAIN_PORT,
            };
            let port = raw_forward
                .port
                .map(|p| p.clamp(1, u16::MAX as u32) as u16)
                .unwrap_or(default_port);
            ForwardSettings {
                transport,
                host: Some(host),
                port: Some(port),
                doh_url: None,
            }
        };

        Ok(DnsSettings {
            upstream_mode: mode,
            forward: Some(forward),
        })
    }
}

impl DnsSettings {
    /// Lenient normalization for blobs already in the store. Legacy shapes
    /// get defaults filled in; an unreadable blob falls back to the default
    /// settings rather than taking resolution down.
    pub fn from_persisted(json: &str) -> Self {
        let raw: RawDnsSettings = match serde_json::from_str(json) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Unreadable persisted DNS settings ({}), using defaults", e);
                return DnsSettings::default();
            }
        };
        match raw.normalize_inner(true) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Invalid persisted DNS settings ({}), using defaults", e);
                DnsSettings::default()
            }
        }
    }
}
