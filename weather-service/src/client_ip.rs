use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use std::convert::Infallible;
use std::net::SocketAddr;

/// Identity of the calling client, used for rate limiting and history.
///
/// Resolved from the first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// TCP peer address. Falls back to `"unknown"` when none is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Longest identity kept; forwarded headers are client-controlled.
pub const MAX_IDENTITY_LEN: usize = 64;

fn bounded(identity: &str) -> String {
    identity.chars().take(MAX_IDENTITY_LEN).collect()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = header_value(headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty())
    {
        return bounded(first);
    }

    if let Some(real_ip) = header_value(headers, "x-real-ip") {
        return bounded(real_ip);
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(resolve(&parts.headers, peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        Some(SocketAddr::from(([192, 168, 1, 20], 51000)))
    }

    #[test]
    fn prefers_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));

        assert_eq!(resolve(&headers, peer()), "203.0.113.7");
    }

    #[test]
    fn falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(resolve(&headers, peer()), "198.51.100.2");

        assert_eq!(resolve(&HeaderMap::new(), peer()), "192.168.1.20");
        assert_eq!(resolve(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn oversized_header_identity_is_truncated() {
        let long = "a".repeat(4096);
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_str(&long).expect("header value"),
        );
        assert_eq!(resolve(&headers, peer()).len(), MAX_IDENTITY_LEN);

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-real-ip",
            HeaderValue::from_str(&long).expect("header value"),
        );
        assert_eq!(resolve(&headers, peer()), "a".repeat(MAX_IDENTITY_LEN));
    }
}
