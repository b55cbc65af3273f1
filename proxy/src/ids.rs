//! Request-id minting, key masking, and client-ip extraction.

use http::HeaderMap;
use uuid::Uuid;

/// Mint a request id. v7 so ids sort by time in the logs.
pub fn new_request_id() -> String {
    Uuid::now_v7().to_string()
}

/// Upstream conversation ids are millisecond timestamps, which keeps them
/// monotonic across a single process.
pub fn new_chat_id() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

pub fn new_message_id() -> String {
    chrono::Utc::now().timestamp_micros().to_string()
}

/// Mask a bearer key for logging. Short keys are fully masked.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        "****".to_string()
    } else {
        format!("{}****{}", &key[..4], &key[key.len() - 4..])
    }
}

/// Best client-ip guess: first element of X-Forwarded-For, then X-Real-IP,
/// then the transport peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<std::net::SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn masking() {
        assert_eq!(mask_key("sk-12345"), "****");
        assert_eq!(mask_key("sk-1234567890abcdef"), "sk-1****cdef");
        assert_eq!(mask_key(""), "****");
    }

    #[test]
    fn forwarded_for_takes_first_element() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 172.16.0.9".parse().unwrap());
        headers.insert("x-real-ip", "192.168.1.1".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "10.0.0.1");
    }

    #[test]
    fn real_ip_then_peer_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "192.168.1.1".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "192.168.1.1");

        let peer = "127.0.0.1:5000".parse().ok();
        assert_eq!(client_ip(&HeaderMap::new(), peer), "127.0.0.1");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn chat_ids_are_numeric_timestamps() {
        let id = new_chat_id();
        assert!(id.parse::<i64>().is_ok());
    }
}
