//! # Dealer wire protocol
//!
//! The dealer pushes JSON text frames discriminated by a top-level `type`
//! string. Frames can be large (context payloads), so the discriminator is
//! extracted with a byte-level scan that never allocates the document;
//! only frames we care about are then fully deserialized.
//!
//! `message` frames carry base64 payload parts which are concatenated
//! after decoding. `request` frames carry a correlation key of the form
//! `<message id>/<device id>` which must validate before dispatch; the
//! reply frame echoes that key with a success flag.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use tracing::debug;

/// Validated correlation key of a dealer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    pub message_id: u64,
    pub device_id: String,
}

impl RequestKey {
    /// Accepts `<positive integer>/<non-empty device id>`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (id, device) = raw.split_once('/')?;
        let message_id: u64 = id.parse().ok()?;
        if message_id == 0 || device.is_empty() {
            return None;
        }
        Some(Self {
            message_id,
            device_id: device.to_string(),
        })
    }

    pub fn to_wire(&self) -> String {
        format!("{}/{}", self.message_id, self.device_id)
    }
}

/// A push notification delivered over the dealer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealerNotification {
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

/// A remote command requiring a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct DealerRequest {
    pub key: RequestKey,
    pub message_ident: String,
    pub command: serde_json::Value,
}

/// One parsed dealer frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DealerMessage {
    Ping,
    Pong,
    Message(DealerNotification),
    Request(DealerRequest),
    Unknown,
}

/// Extracts the top-level `type` value without parsing the document.
///
/// Scans bytes tracking nesting depth and string state; only a string
/// keyed `"type"` directly inside the root object matches.
pub fn scan_message_type(raw: &[u8]) -> Option<String> {
    let mut i = 0;
    while i < raw.len() && raw[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= raw.len() || raw[i] != b'{' {
        return None;
    }

    let mut depth = 0usize;
    while i < raw.len() {
        match raw[i] {
            b'{' | b'[' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b'"' => {
                let (content, after) = read_string(raw, i)?;
                i = after;

                if depth != 1 {
                    continue;
                }
                // Keys are followed by a colon; values are not.
                let mut j = i;
                while j < raw.len() && raw[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j >= raw.len() || raw[j] != b':' {
                    continue;
                }
                if content != b"type" {
                    continue;
                }
                j += 1;
                while j < raw.len() && raw[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j < raw.len() && raw[j] == b'"' {
                    let (value, _) = read_string(raw, j)?;
                    return Some(String::from_utf8_lossy(value).into_owned());
                }
                return None;
            }
            _ => i += 1,
        }
    }
    None
}

/// Reads a JSON string starting at the opening quote; returns the raw
/// content and the index just past the closing quote.
fn read_string(raw: &[u8], open: usize) -> Option<(&[u8], usize)> {
    let mut i = open + 1;
    while i < raw.len() {
        match raw[i] {
            b'\\' => i += 2,
            b'"' => return Some((&raw[open + 1..i], i + 1)),
            _ => i += 1,
        }
    }
    None
}

#[derive(Deserialize)]
struct WireMessage {
    uri: Option<String>,
    headers: Option<HashMap<String, Option<String>>>,
    payloads: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct WireRequestPayload {
    command: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireRequest {
    key: Option<String>,
    message_ident: Option<String>,
    payload: Option<WireRequestPayload>,
}

/// Parses one text frame. Malformed frames degrade to `Unknown`.
pub fn parse_frame(text: &str) -> DealerMessage {
    let Some(kind) = scan_message_type(text.as_bytes()) else {
        return DealerMessage::Unknown;
    };

    match kind.as_str() {
        "ping" => DealerMessage::Ping,
        "pong" => DealerMessage::Pong,
        "message" => parse_notification(text).unwrap_or(DealerMessage::Unknown),
        "request" => parse_request(text).unwrap_or(DealerMessage::Unknown),
        other => {
            debug!(kind = other, "unknown dealer frame type");
            DealerMessage::Unknown
        }
    }
}

fn parse_notification(text: &str) -> Option<DealerMessage> {
    let wire: WireMessage = serde_json::from_str(text).ok()?;

    // Null header values are dropped; only string values survive.
    let headers = wire
        .headers
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();

    let mut payload = Vec::new();
    for part in wire.payloads.unwrap_or_default() {
        payload.extend_from_slice(&BASE64.decode(part.as_bytes()).ok()?);
    }

    Some(DealerMessage::Message(DealerNotification {
        uri: wire.uri.unwrap_or_default(),
        headers,
        payload,
    }))
}

fn parse_request(text: &str) -> Option<DealerMessage> {
    let wire: WireRequest = serde_json::from_str(text).ok()?;
    let key = RequestKey::parse(&wire.key?)?;
    let command = wire.payload?.command?;

    Some(DealerMessage::Request(DealerRequest {
        key,
        message_ident: wire.message_ident.unwrap_or_default(),
        command,
    }))
}

/// Builds the reply frame for a request key.
pub fn reply_frame(key: &RequestKey, success: bool) -> String {
    serde_json::json!({
        "type": "reply",
        "key": key.to_wire(),
        "payload": { "success": success },
    })
    .to_string()
}

/// The outbound ping frame.
pub fn ping_frame() -> &'static str {
    r#"{"type":"ping"}"#
}

/// The outbound pong frame.
pub fn pong_frame() -> &'static str {
    r#"{"type":"pong"}"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_type_without_full_parse() {
        assert_eq!(
            scan_message_type(br#"{"type":"ping"}"#).as_deref(),
            Some("ping")
        );
        assert_eq!(
            scan_message_type(br#"  { "headers": {"type": "decoy"}, "type" : "message" }"#)
                .as_deref(),
            Some("message")
        );
        // A string value containing "type" is not a key.
        assert_eq!(
            scan_message_type(br#"{"uri":"type","type":"pong"}"#).as_deref(),
            Some("pong")
        );
        assert_eq!(scan_message_type(br#"{"uri":"x"}"#), None);
        assert_eq!(scan_message_type(b"not json"), None);
        assert_eq!(scan_message_type(br#"{"type": 7}"#), None);
    }

    #[test]
    fn parses_ping_pong_and_unknown() {
        assert_eq!(parse_frame(r#"{"type":"ping"}"#), DealerMessage::Ping);
        assert_eq!(parse_frame(r#"{"type":"pong"}"#), DealerMessage::Pong);
        assert_eq!(parse_frame(r#"{"type":"mystery"}"#), DealerMessage::Unknown);
        assert_eq!(parse_frame("{broken"), DealerMessage::Unknown);
    }

    #[test]
    fn message_payloads_concatenate_and_null_headers_drop() {
        let frame = r#"{
            "type": "message",
            "uri": "hm://connect-state/v1/cluster",
            "headers": {"content-type": "application/json", "transfer-encoding": null},
            "payloads": ["aGVs", "bG8="]
        }"#;
        let DealerMessage::Message(message) = parse_frame(frame) else {
            panic!("expected a message frame");
        };
        assert_eq!(message.uri, "hm://connect-state/v1/cluster");
        assert_eq!(message.payload, b"hello");
        assert_eq!(
            message.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert!(!message.headers.contains_key("transfer-encoding"));
    }

    #[test]
    fn malformed_base64_degrades_to_unknown() {
        let frame = r#"{"type":"message","uri":"x","payloads":["!!!not base64"]}"#;
        assert_eq!(parse_frame(frame), DealerMessage::Unknown);
    }

    #[test]
    fn request_key_validation() {
        assert!(RequestKey::parse("12345/device-abc").is_some());
        assert!(RequestKey::parse("0/device").is_none());
        assert!(RequestKey::parse("-3/device").is_none());
        assert!(RequestKey::parse("12345/").is_none());
        assert!(RequestKey::parse("no-slash").is_none());
        assert!(RequestKey::parse("abc/device").is_none());
    }

    #[test]
    fn parses_requests_and_rejects_bad_keys() {
        let frame = r#"{
            "type": "request",
            "key": "42/device-1",
            "message_ident": "hm://connect-state/v1/player/command",
            "payload": {"command": {"endpoint": "pause"}}
        }"#;
        let DealerMessage::Request(request) = parse_frame(frame) else {
            panic!("expected a request frame");
        };
        assert_eq!(request.key.message_id, 42);
        assert_eq!(request.key.device_id, "device-1");
        assert_eq!(request.command["endpoint"], "pause");

        let bad_key = r#"{"type":"request","key":"oops","payload":{"command":{}}}"#;
        assert_eq!(parse_frame(bad_key), DealerMessage::Unknown);
    }

    #[test]
    fn reply_frame_echoes_the_key() {
        let key = RequestKey::parse("7/dev").unwrap();
        let reply = reply_frame(&key, true);
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "reply");
        assert_eq!(value["key"], "7/dev");
        assert_eq!(value["payload"]["success"], true);
    }
}
