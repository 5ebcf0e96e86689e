//! Client identification for rate-limit partitioning.
//!
//! The identity is a partition key, not an authenticated principal. Callers
//! without usable metadata share the `anonymous` budget.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Identity shared by every caller with no distinguishing metadata.
pub const ANONYMOUS: &str = "anonymous";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Opaque rate-limit partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request metadata the identifier may look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestMetadata<'a> {
    pub headers: &'a HeaderMap,
    pub peer: Option<SocketAddr>,
}

/// Derives a [`ClientIdentity`] from request metadata.
#[derive(Debug, Clone, Copy)]
pub struct ClientIdentifier {
    trust_forwarded_headers: bool,
}

impl ClientIdentifier {
    pub fn new(trust_forwarded_headers: bool) -> Self {
        Self {
            trust_forwarded_headers,
        }
    }

    /// Pure and total: always returns an identity.
    ///
    /// Order: first X-Forwarded-For hop, X-Real-IP (both only when trusted),
    /// then the socket peer, then [`ANONYMOUS`]. Header values must parse as
    /// IP addresses so arbitrary strings never become keys.
    pub fn identify(&self, meta: RequestMetadata<'_>) -> ClientIdentity {
        if self.trust_forwarded_headers {
            let forwarded = header_str(meta.headers, X_FORWARDED_FOR)
                .and_then(|v| v.split(',').next())
                .and_then(parse_ip);
            if let Some(ip) = forwarded {
                return ClientIdentity(ip.to_string());
            }

            if let Some(ip) = header_str(meta.headers, X_REAL_IP).and_then(parse_ip) {
                return ClientIdentity(ip.to_string());
            }
        }

        match meta.peer {
            Some(addr) => ClientIdentity(addr.ip().to_string()),
            None => ClientIdentity::anonymous(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("10.0.0.9:51234".parse().unwrap())
    }

    #[test]
    fn test_forwarded_for_first_hop_wins() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        let id = ClientIdentifier::new(true).identify(RequestMetadata { headers: &h, peer: peer() });
        assert_eq!(id.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_used_when_forwarded_is_garbage() {
        let h = headers(&[("x-forwarded-for", "not-an-ip"), ("x-real-ip", "198.51.100.2")]);
        let id = ClientIdentifier::new(true).identify(RequestMetadata { headers: &h, peer: peer() });
        assert_eq!(id.as_str(), "198.51.100.2");
    }

    #[test]
    fn test_untrusted_headers_are_ignored() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7")]);
        let id = ClientIdentifier::new(false).identify(RequestMetadata { headers: &h, peer: peer() });
        assert_eq!(id.as_str(), "10.0.0.9");
    }

    #[test]
    fn test_falls_back_to_anonymous() {
        let h = HeaderMap::new();
        let id = ClientIdentifier::new(true).identify(RequestMetadata { headers: &h, peer: None });
        assert!(id.is_anonymous());
        assert_eq!(id.to_string(), ANONYMOUS);
    }
}
