use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

pub const FORWARDED_HOST: &str = "x-forwarded-host";
pub const FORWARDED_PORT: &str = "x-forwarded-port";
pub const REAL_IP: &str = "x-real-ip";

// ── Data types ───────────────────────────────────────────────────────────────

/// Access rules bound to an issued API key.
///
/// Every field defaults to its wildcard: an empty host, no ranges and no
/// expiry together authorize any request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyPolicy {
    /// Single hostname the key is scoped to. Empty means any host.
    #[serde(default)]
    pub allowed_fqdn: String,
    /// CIDR ranges the caller must originate from. Empty means anywhere.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Unix seconds at which the key stops being valid.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// The proxy-forwarded headers a policy is checked against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedRequest {
    pub forwarded_host: String,
    pub forwarded_port: String,
    pub real_ip: String,
}

impl ForwardedRequest {
    /// Missing or non-ASCII header values become empty strings.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned()
        };

        Self {
            forwarded_host: get(FORWARDED_HOST),
            forwarded_port: get(FORWARDED_PORT),
            real_ip: get(REAL_IP),
        }
    }
}

/// Why a request was refused under a key's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    #[error("api_key_invalid_fqdn")]
    InvalidFqdn,
    #[error("api_key_invalid_ip")]
    InvalidIp,
    #[error("api_key_expired")]
    Expired,
}

impl Denial {
    /// Stable code used in logs and response bodies.
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidFqdn => "api_key_invalid_fqdn",
            Self::InvalidIp => "api_key_invalid_ip",
            Self::Expired => "api_key_expired",
        }
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Checks `request` against `policy` at time `now` (unix seconds).
///
/// Rules (in order, first failure wins):
/// 1. Forwarded host must equal the allowed FQDN, with `:port` appended
///    unless the forwarded port is 80 or 443.
/// 2. Real IP must fall inside at least one allowed range.
/// 3. `now` must be strictly before the expiry.
///
/// Unparsable ports, addresses and ranges never match.
pub fn validate(
    policy: &ApiKeyPolicy,
    request: &ForwardedRequest,
    now: i64,
) -> Result<(), Denial> {
    if !policy.allowed_fqdn.is_empty() && !host_matches(&policy.allowed_fqdn, request) {
        return Err(Denial::InvalidFqdn);
    }

    if !policy.allowed_ips.is_empty() && !ip_allowed(&policy.allowed_ips, &request.real_ip) {
        return Err(Denial::InvalidIp);
    }

    if matches!(policy.expires_at, Some(exp) if now >= exp) {
        return Err(Denial::Expired);
    }

    Ok(())
}

fn host_matches(fqdn: &str, request: &ForwardedRequest) -> bool {
    // Only the canonical decimal form counts: no sign, no leading zeros.
    let port = match request.forwarded_port.parse::<u16>() {
        Ok(port) if port.to_string() == request.forwarded_port => port,
        _ => return false,
    };

    match port {
        80 | 443 => request.forwarded_host == fqdn,
        _ => request.forwarded_host == format!("{fqdn}:{port}"),
    }
}

fn ip_allowed(ranges: &[String], real_ip: &str) -> bool {
    // IPv4-mapped IPv6 (`::ffff:a.b.c.d`) is checked as plain IPv4.
    let Ok(ip) = real_ip.parse::<IpAddr>().map(|ip| ip.to_canonical()) else {
        return false;
    };

    ranges.iter().any(|r| {
        r.parse::<IpNet>()
            .map(|net| net.contains(&ip))
            .unwrap_or(false)
    })
}

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
