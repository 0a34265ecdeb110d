//! WebSocket wire protocol.
//!
//! Every frame is a JSON object tagged by `op`.
//!
//! Client to server:
//! - `{"op":"subscribe","operationId":"sum","args":[2,3],"sessionToken":null}`
//! - `{"op":"unsubscribe","key":"sum(2,3)"}`
//!
//! Server to client:
//! - `{"op":"connected","publisherId":"…","connectionId":"…"}` (once)
//! - `{"op":"update","key":"sum(2,3)","version":1,"value":5}` (or `"error"`)
//! - `{"op":"unsubscribed","key":"sum(2,3)"}`
//! - `{"op":"error","message":"…","key":"…"}`

use kinetic_core::{ConnectionId, PublicationUpdate, PublisherId, Session, Value};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        #[serde(rename = "operationId")]
        operation_id: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default, rename = "sessionToken")]
        session_token: Option<String>,
    },
    Unsubscribe {
        key: String,
    },
}

impl ClientFrame {
    pub fn parse(text: &str) -> ApiResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| ApiError::invalid_input(format!("Malformed frame: {}", e)))
    }
}

/// Session carried by a subscribe frame. Blank tokens count as none.
pub fn session_from_token(token: Option<String>) -> Option<Session> {
    token
        .filter(|token| !token.trim().is_empty())
        .map(Session::new)
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        #[serde(rename = "publisherId")]
        publisher_id: PublisherId,
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    Update(PublicationUpdate),
    Unsubscribed {
        key: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
}

impl ServerFrame {
    pub fn error(err: &ApiError, key: Option<String>) -> Self {
        Self::Error {
            message: err.message.clone(),
            key,
        }
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize server frame");
            r#"{"op":"error","message":"Failed to serialize frame"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinetic_core::{CachedResult, ComputationKey, ProductionFailure, Version};
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscribe() {
        let frame = ClientFrame::parse(
            r#"{"op":"subscribe","operationId":"sum","args":[2,3],"sessionToken":"s1"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                operation_id: "sum".to_string(),
                args: vec![json!(2), json!(3)],
                session_token: Some("s1".to_string()),
            }
        );

        let frame = ClientFrame::parse(r#"{"op":"subscribe","operationId":"time"}"#).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Subscribe { args, session_token: None, .. } if args.is_empty()
        ));
    }

    #[test]
    fn test_parse_unsubscribe_and_garbage() {
        let frame = ClientFrame::parse(r#"{"op":"unsubscribe","key":"time()"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Unsubscribe {
                key: "time()".to_string()
            }
        );

        assert!(ClientFrame::parse("not json").is_err());
        assert!(ClientFrame::parse(r#"{"op":"publish"}"#).is_err());
    }

    #[test]
    fn test_session_from_token() {
        assert_eq!(session_from_token(None), None);
        assert_eq!(session_from_token(Some("  ".to_string())), None);
        assert_eq!(
            session_from_token(Some("abc".to_string())),
            Some(Session::new("abc"))
        );
    }

    #[test]
    fn test_update_frame_shape() {
        let result = CachedResult::new(
            ComputationKey::new("sum", vec![json!(2), json!(3)]),
            Version::new(4),
            Ok(json!(5)),
            vec![],
        );
        let frame = ServerFrame::Update(PublicationUpdate::from_result(&result));
        let json: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(
            json,
            json!({"op": "update", "key": "sum(2,3)", "version": 4, "value": 5})
        );

        let failed = CachedResult::new(
            ComputationKey::new("sum", vec![]),
            Version::new(1),
            Err(ProductionFailure::new("expected two numbers")),
            vec![],
        );
        let frame = ServerFrame::Update(PublicationUpdate::from_result(&failed));
        let json: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["error"]["message"], "expected two numbers");
        assert!(json.get("value").is_none());
    }

    #[test]
    fn test_connected_and_error_frames() {
        let frame = ServerFrame::Connected {
            publisher_id: PublisherId::new(),
            connection_id: ConnectionId::new(),
        };
        let json: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json["op"], "connected");
        assert!(json["publisherId"].is_string());
        assert!(json["connectionId"].is_string());

        let frame = ServerFrame::error(&ApiError::invalid_input("bad"), None);
        let json: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(json, json!({"op": "error", "message": "bad"}));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_parse_never_panics(text in ".{0,64}") {
            let _ = ClientFrame::parse(&text);
        }

        #[test]
        fn prop_unsubscribe_key_round_trips(key in "[a-z]{1,8}\\([0-9,]{0,8}\\)") {
            let text = json!({"op": "unsubscribe", "key": key.clone()}).to_string();
            prop_assert_eq!(ClientFrame::parse(&text).unwrap(), ClientFrame::Unsubscribe { key });
        }

        #[test]
        fn prop_blank_token_is_no_session(token in "[ \\t]{0,6}") {
            prop_assert_eq!(session_from_token(Some(token)), None);
        }
    }
}
