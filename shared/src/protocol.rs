//! Control-connection protocol for Relaytap.
//!
//! Every frame on the control connection is a UTF-8 JSON object tagged by
//! its `type` field. Bodies travel as standard base64 so arbitrary bytes
//! survive the text transport.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum frame size accepted from the tunnel server (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Header map as carried on the wire. Duplicate names are already collapsed.
pub type Headers = BTreeMap<String, String>;

/// A single control-connection frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Tunnel identity assigned by the server
    Connected(TunnelInfo),
    /// Inbound HTTP request to replay against the local server
    Request(TunnelRequest),
    /// Result of a relayed request, correlated by `request_id`
    Response(TunnelResponse),
    /// Server-side failure; terminal for the session
    Error { error: String },
}

/// Identity of an established tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub subdomain: String,
    pub public_url: String,
}

/// Request forwarded through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_body")]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub is_replay: bool,
}

/// Response from the local server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_body")]
    pub body: Option<Vec<u8>>,
}

impl ControlMessage {
    /// Decode a text frame. Unknown kinds, missing fields and out-of-range
    /// statuses are all protocol errors.
    pub fn decode(text: &str) -> Result<Self> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                text.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let message: ControlMessage =
            serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))?;

        if let ControlMessage::Response(response) = &message {
            if !is_valid_status(response.status) {
                return Err(Error::Protocol(format!("invalid status {}", response.status)));
            }
        }

        Ok(message)
    }

    /// Encode as a JSON text frame
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name of the message kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Connected(_) => "connected",
            ControlMessage::Request(_) => "request",
            ControlMessage::Response(_) => "response",
            ControlMessage::Error { .. } => "error",
        }
    }
}

/// HTTP status codes the protocol carries
pub fn is_valid_status(status: u16) -> bool {
    (100..=599).contains(&status)
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match body {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request() {
        let text = r#"{
            "type": "request",
            "request_id": "r2",
            "method": "POST",
            "path": "/webhooks/x",
            "headers": {"content-type": "application/json"},
            "body": "e30=",
            "is_replay": false
        }"#;

        match ControlMessage::decode(text).unwrap() {
            ControlMessage::Request(req) => {
                assert_eq!(req.request_id, "r2");
                assert_eq!(req.method, "POST");
                assert_eq!(req.path, "/webhooks/x");
                assert_eq!(req.headers.get("content-type").map(String::as_str), Some("application/json"));
                assert_eq!(req.body.as_deref(), Some(&b"{}"[..]));
                assert!(!req.is_replay);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_request_defaults() {
        let text = r#"{"type":"request","request_id":"r1","method":"GET","path":"/health"}"#;
        match ControlMessage::decode(text).unwrap() {
            ControlMessage::Request(req) => {
                assert!(req.headers.is_empty());
                assert!(req.body.is_none());
                assert!(!req.is_replay);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_connected_and_error() {
        let connected = r#"{"type":"connected","tunnel_id":"t1","subdomain":"demo","public_url":"https://demo.example.com"}"#;
        assert_eq!(
            ControlMessage::decode(connected).unwrap(),
            ControlMessage::Connected(TunnelInfo {
                tunnel_id: "t1".into(),
                subdomain: "demo".into(),
                public_url: "https://demo.example.com".into(),
            })
        );

        let error = r#"{"type":"error","error":"subdomain taken"}"#;
        assert_eq!(
            ControlMessage::decode(error).unwrap(),
            ControlMessage::Error { error: "subdomain taken".into() }
        );
    }

    #[test]
    fn test_encode_response() {
        let msg = ControlMessage::Response(TunnelResponse {
            request_id: "r1".into(),
            status: 200,
            headers: Headers::new(),
            body: Some(b"ok".to_vec()),
        });

        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["request_id"], "r1");
        assert_eq!(value["status"], 200);
        assert_eq!(value["body"], "b2s=");
    }

    #[test]
    fn test_encode_omits_missing_body() {
        let msg = ControlMessage::Response(TunnelResponse {
            request_id: "r3".into(),
            status: 204,
            headers: Headers::new(),
            body: None,
        });
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert!(value.get("body").is_none());
    }

    #[test]
    fn test_malformed_frames() {
        assert!(ControlMessage::decode("not json").is_err());
        assert!(ControlMessage::decode(r#"{"type":"bogus"}"#).is_err());
        assert!(ControlMessage::decode(r#"{"type":"request","request_id":"r1"}"#).is_err());
        assert!(ControlMessage::decode(
            r#"{"type":"request","request_id":"r1","method":"GET","path":"/","body":"***"}"#
        )
        .is_err());
        assert!(ControlMessage::decode(r#"{"type":"response","request_id":"r1","status":42}"#).is_err());
    }
}
