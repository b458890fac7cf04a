use hyper::header::{HeaderMap, HeaderName, CONNECTION};

/// Headers meaningful only for a single transport hop (RFC 7230 §6.1)
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Non-standard proxy header some clients still send
pub const PROXY_CONNECTION: &str = "proxy-connection";

pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    // Collect the Connection-listed names before Connection itself goes
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for h in HOP_BY_HOP_HEADERS {
        headers.remove(*h);
    }
    for name in listed {
        headers.remove(name);
    }
}

/// Copy `src` into `dst`, skipping hop-by-hop headers. Multi-valued headers keep every value.
pub fn copy_end_to_end_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    let mut filtered = src.clone();
    strip_hop_by_hop_headers(&mut filtered);
    for (name, value) in filtered.iter() {
        dst.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("TE"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("X-Cache-Status"));
    }

    #[test]
    fn test_strip_removes_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close, X-Trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_copy_keeps_multiple_values() {
        let mut src = HeaderMap::new();
        src.append("set-cookie", HeaderValue::from_static("a=1"));
        src.append("set-cookie", HeaderValue::from_static("b=2"));
        src.insert("transfer-encoding", HeaderValue::from_static("chunked"));

        let mut dst = HeaderMap::new();
        copy_end_to_end_headers(&src, &mut dst);

        assert_eq!(dst.get_all("set-cookie").iter().count(), 2);
        assert!(!dst.contains_key("transfer-encoding"));
    }
}
