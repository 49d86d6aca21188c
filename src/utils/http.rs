//! HTTP utility functions

use hyper::HeaderMap;

/// Headers addressed to this proxy rather than to the origin
const PROXY_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// Check if a header is a hop-by-hop header
pub fn is_hop_by_hop_header(name: &str) -> bool {
    let hop_by_hop_headers = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];

    hop_by_hop_headers.contains(&name.to_lowercase().as_str())
}

/// Remove the headers a client addresses to its proxy before forwarding a request.
///
/// Framing and upgrade headers stay: the request is re-encoded with the same body
/// framing and upgrades are relayed end to end.
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    for name in PROXY_HEADERS {
        debug_assert!(is_hop_by_hop_header(name));
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("Proxy-Connection"));
        assert!(!is_hop_by_hop_header("content-type"));
    }

    #[test]
    fn test_strip_proxy_headers_keeps_the_rest() {
        let mut headers = HeaderMap::new();
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("host", HeaderValue::from_static("example.com"));

        strip_proxy_headers(&mut headers);
        assert!(headers.get("proxy-connection").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert_eq!(headers.get("upgrade").unwrap(), "websocket");
        assert_eq!(headers.len(), 2);
    }
}
