//! Client identity extraction.

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Key used when a request carries no usable address.
pub const UNKNOWN_CLIENT: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Derive the rate-limit key for a request.
///
/// With `trust_forwarded_headers` the first `X-Forwarded-For` hop wins,
/// then `X-Real-IP`; the peer address is the fallback (and the only source
/// otherwise). Addresses are normalized so that an IPv4 client seen over an
/// IPv4-mapped IPv6 socket gets the same key as over IPv4.
pub fn client_key(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_headers: bool,
) -> String {
    let forwarded = if trust_forwarded_headers {
        forwarded_ip(headers)
    } else {
        None
    };

    forwarded
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| normalize(ip).to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let from_forwarded_for = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(parse_ip);

    from_forwarded_for.or_else(|| {
        headers
            .get(X_REAL_IP)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_ip)
    })
}

/// Parse a bare address or an `address:port` pair.
fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

fn normalize(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[test]
    fn test_peer_address() {
        let key = client_key(&HeaderMap::new(), peer("192.168.1.10:54321"), false);
        assert_eq!(key, "192.168.1.10");
    }

    #[test]
    fn test_ipv4_mapped_peer_is_normalized() {
        let key = client_key(&HeaderMap::new(), peer("[::ffff:10.0.0.7]:8080"), false);
        assert_eq!(key, "10.0.0.7");
    }

    #[test]
    fn test_ipv6_peer() {
        let key = client_key(&HeaderMap::new(), peer("[2001:db8::1]:443"), false);
        assert_eq!(key, "2001:db8::1");
    }

    #[test]
    fn test_forwarded_headers_ignored_unless_trusted() {
        let headers = headers(&[("x-forwarded-for", "203.0.113.5")]);
        let key = client_key(&headers, peer("10.0.0.1:1000"), false);
        assert_eq!(key, "10.0.0.1");
    }

    #[test]
    fn test_first_forwarded_hop_wins() {
        let headers = headers(&[
            ("x-forwarded-for", "203.0.113.5, 10.0.0.2, 10.0.0.3"),
            ("x-real-ip", "198.51.100.9"),
        ]);
        let key = client_key(&headers, peer("10.0.0.1:1000"), true);
        assert_eq!(key, "203.0.113.5");
    }

    #[test]
    fn test_real_ip_fallback() {
        let headers = headers(&[
            ("x-forwarded-for", "not-an-address"),
            ("x-real-ip", "198.51.100.9:4000"),
        ]);
        let key = client_key(&headers, peer("10.0.0.1:1000"), true);
        assert_eq!(key, "198.51.100.9");
    }

    #[test]
    fn test_invalid_headers_fall_back_to_peer() {
        let headers = headers(&[("x-real-ip", "garbage")]);
        let key = client_key(&headers, peer("10.0.0.1:1000"), true);
        assert_eq!(key, "10.0.0.1");
    }

    #[test]
    fn test_unknown_client() {
        assert_eq!(client_key(&HeaderMap::new(), None, true), UNKNOWN_CLIENT);
    }
}
