//! Envelope header preparation.
//!
//! Strips hop-by-hop headers per RFC 7230 §6.1 (including anything named
//! in Connection) and injects the standard forwarded headers before a
//! request crosses the control channel.

use uniroute_shared::frame::Headers;

/// Headers that never cross the proxy boundary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Prepare request headers for the envelope: hop-by-hop stripped, proxy
/// headers injected. Websocket upgrades keep Upgrade/Connection so the
/// client can complete the handshake locally.
pub fn prepare_request_headers(
    headers: &mut Headers,
    client_ip: Option<&str>,
    host: &str,
    preserve_upgrade: bool,
) {
    strip_hop_by_hop(headers, preserve_upgrade);

    if let Some(ip) = client_ip {
        append_forwarded_for(headers, ip);
        upsert(headers, "X-Real-IP", ip);
    }
    upsert(headers, "X-Forwarded-Proto", "https");
    upsert(headers, "X-Forwarded-Host", host);
}

/// Strip hop-by-hop headers from a response before it reaches the caller.
pub fn prepare_response_headers(headers: &mut Headers) {
    strip_hop_by_hop(headers, false);
}

fn strip_hop_by_hop(headers: &mut Headers, preserve_upgrade: bool) {
    // Connection may name additional hop-by-hop headers.
    let mut named: Vec<String> = Vec::new();
    for (key, value) in headers.iter() {
        if key.eq_ignore_ascii_case("connection") {
            named.extend(
                value
                    .split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty()),
            );
        }
    }

    headers.retain(|(key, _)| {
        let key = key.to_ascii_lowercase();
        if preserve_upgrade && (key == "upgrade" || key == "connection") {
            return true;
        }
        !HOP_BY_HOP.contains(&key.as_str()) && !named.contains(&key)
    });
}

fn append_forwarded_for(headers: &mut Headers, ip: &str) {
    if let Some(existing) = headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case("x-forwarded-for"))
    {
        existing.1 = format!("{}, {}", existing.1, ip);
    } else {
        headers.push(("X-Forwarded-For".to_string(), ip.to_string()));
    }
}

fn upsert(headers: &mut Headers, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has(headers: &Headers, key: &str) -> bool {
        headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    #[test]
    fn test_hop_by_hop_stripped() {
        let mut h: Headers = vec![
            ("Host".into(), "myapp.example.com".into()),
            ("Connection".into(), "keep-alive".into()),
            ("Keep-Alive".into(), "timeout=5".into()),
            ("Transfer-Encoding".into(), "chunked".into()),
            ("Accept".into(), "*/*".into()),
        ];
        prepare_request_headers(&mut h, None, "myapp.example.com", false);
        assert!(!has(&h, "connection"));
        assert!(!has(&h, "keep-alive"));
        assert!(!has(&h, "transfer-encoding"));
        assert!(has(&h, "accept"));
    }

    #[test]
    fn test_connection_named_headers_stripped() {
        let mut h: Headers = vec![
            ("Connection".into(), "close, X-Session-Token".into()),
            ("X-Session-Token".into(), "abc".into()),
            ("X-Other".into(), "keep".into()),
        ];
        prepare_request_headers(&mut h, None, "h", false);
        assert!(!has(&h, "x-session-token"));
        assert!(has(&h, "x-other"));
    }

    #[test]
    fn test_forwarded_headers_injected() {
        let mut h: Headers = vec![];
        prepare_request_headers(&mut h, Some("1.2.3.4"), "myapp.example.com", false);
        assert!(h
            .iter()
            .any(|(k, v)| k == "X-Forwarded-For" && v == "1.2.3.4"));
        assert!(h
            .iter()
            .any(|(k, v)| k == "X-Forwarded-Host" && v == "myapp.example.com"));
        assert!(h.iter().any(|(k, v)| k == "X-Real-IP" && v == "1.2.3.4"));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut h: Headers = vec![("X-Forwarded-For".into(), "9.9.9.9".into())];
        prepare_request_headers(&mut h, Some("1.2.3.4"), "h", false);
        assert!(h
            .iter()
            .any(|(k, v)| k == "X-Forwarded-For" && v == "9.9.9.9, 1.2.3.4"));
    }

    #[test]
    fn test_upgrade_preserved_for_websocket() {
        let mut h: Headers = vec![
            ("Connection".into(), "Upgrade".into()),
            ("Upgrade".into(), "websocket".into()),
        ];
        prepare_request_headers(&mut h, None, "h", true);
        assert!(has(&h, "upgrade"));
        assert!(has(&h, "connection"));
    }
}
