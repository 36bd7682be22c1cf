//! Requester signatures.
//!
//! A signature is the SHA-256 digest of the request fields that matter for a
//! [`LimitLevel`]. Fields are length-prefixed before hashing so no choice of
//! field values can collide with a different split of the same bytes.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Query};
use axum::http::request::Parts;
use sha2::{Digest, Sha256};

use super::rules::LimitLevel;

/// Key suffix of the window timer stored next to each counter.
pub const TIMER_SUFFIX: &str = ":timer";

/// Client IP used when none can be determined.
const UNKNOWN_IP: &str = "unknown";

/// Request extension naming the authenticated user.
///
/// Inserted by an upstream authentication layer. Requests without it are
/// anonymous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Who is making a request, as far as limiting is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequesterContext {
    /// Authenticated user id, `None` for anonymous requests
    pub user_id: Option<String>,
    /// Client IP address
    pub client_ip: String,
    /// Device identifier taken from the configured request parameter
    pub device_id: String,
}

impl RequesterContext {
    pub fn new(user_id: Option<&str>, client_ip: &str, device_id: &str) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            client_ip: client_ip.to_string(),
            device_id: device_id.to_string(),
        }
    }
}

/// A fixed-length requester identity used as the store key namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    /// Wrap an already-computed signature, e.g. one received by an admin endpoint.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key of the attempt counter.
    pub fn counter_key(&self) -> &str {
        &self.0
    }

    /// Store key of the window timer.
    pub fn timer_key(&self) -> String {
        format!("{}{}", self.0, TIMER_SUFFIX)
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives signatures and requester contexts.
#[derive(Debug, Clone)]
pub struct SignatureResolver {
    /// Request parameter carrying the device identifier
    device_param: String,
    /// Peers allowed to name the client in forwarding headers
    trusted_proxies: HashSet<IpAddr>,
}

impl SignatureResolver {
    pub fn new(device_param: impl Into<String>) -> Self {
        Self {
            device_param: device_param.into(),
            trusted_proxies: HashSet::new(),
        }
    }

    /// Honour `x-real-ip` and `x-forwarded-for` from these peers only.
    pub fn with_trusted_proxies(mut self, proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        self.trusted_proxies = proxies.into_iter().collect();
        self
    }

    /// Build the requester context from request parts.
    ///
    /// The client IP is the socket peer. When the peer is a trusted proxy, the
    /// IP is taken from `x-real-ip`, else from `x-forwarded-for` read right to
    /// left up to the first hop that is not itself a trusted proxy.
    pub fn requester(&self, parts: &Parts) -> RequesterContext {
        let user_id = parts
            .extensions
            .get::<AuthenticatedUser>()
            .map(|user| user.0.clone());

        let peer_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());

        let client_ip = match peer_ip {
            Some(peer) if self.trusted_proxies.contains(&peer) => self
                .forwarded_ip(parts)
                .unwrap_or_else(|| peer.to_string()),
            Some(peer) => peer.to_string(),
            None => UNKNOWN_IP.to_string(),
        };

        let device_id = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(mut params)| params.remove(&self.device_param))
            .unwrap_or_default();

        RequesterContext {
            user_id,
            client_ip,
            device_id,
        }
    }

    fn forwarded_ip(&self, parts: &Parts) -> Option<String> {
        let header = |name: &str| parts.headers.get(name).and_then(|h| h.to_str().ok());

        if let Some(ip) = header("x-real-ip").map(str::trim).filter(|ip| !ip.is_empty()) {
            return Some(ip.to_string());
        }

        let hops: Vec<&str> = header("x-forwarded-for")?
            .split(',')
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .collect();

        hops.iter()
            .rev()
            .find(|hop| {
                hop.parse::<IpAddr>()
                    .map_or(true, |ip| !self.trusted_proxies.contains(&ip))
            })
            .or(hops.first())
            .map(|hop| hop.to_string())
    }

    /// Compute the signature of a request at the given level.
    pub fn signature(
        &self,
        method: &str,
        path: &str,
        level: LimitLevel,
        requester: &RequesterContext,
    ) -> Signature {
        let mut encoder = FieldEncoder::new(level);
        encoder.field(method);

        match level {
            LimitLevel::Api => {}
            LimitLevel::Device => {
                encoder.optional(requester.user_id.as_deref());
                encoder.field(&requester.client_ip);
                encoder.field(&requester.device_id);
            }
            LimitLevel::User => {
                encoder.optional(requester.user_id.as_deref());
                encoder.field(&requester.client_ip);
            }
            LimitLevel::Ip => {
                encoder.field(&requester.client_ip);
            }
        }

        encoder.field(path);
        encoder.finish()
    }
}

/// Feeds length-prefixed fields into a SHA-256 hasher.
struct FieldEncoder {
    hasher: Sha256,
}

impl FieldEncoder {
    fn new(level: LimitLevel) -> Self {
        let tag: u8 = match level {
            LimitLevel::Api => 0,
            LimitLevel::Device => 1,
            LimitLevel::User => 2,
            LimitLevel::Ip => 3,
        };
        let mut hasher = Sha256::new();
        hasher.update([tag]);
        Self { hasher }
    }

    fn field(&mut self, value: &str) {
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value.as_bytes());
    }

    /// A field that may be absent; absence is distinct from the empty string.
    fn optional(&mut self, value: Option<&str>) {
        match value {
            Some(v) => {
                self.hasher.update([1u8]);
                self.field(v);
            }
            None => self.hasher.update([0u8]),
        }
    }

    fn finish(self) -> Signature {
        Signature(format!("{:x}", self.hasher.finalize()))
    }
}
