//! Relay wire messages.
//!
//! Frames are JSON arrays. Inbound text is decoded exactly once, at
//! the transport boundary, into the closed [`RelayMessage`] union;
//! everything downstream matches on the enum instead of inspecting
//! strings.
//!
//! - Client to relay: EVENT, REQ, CLOSE, AUTH
//! - Relay to client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH

use crate::error::{ClientError, Result};
use reel_core::{Event, Filter};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event: `["EVENT", <event JSON>]`
    Event(Event),

    /// Subscribe to events: `["REQ", <subscription_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },

    /// Authentication assertion: `["AUTH", <event JSON>]`
    Auth(Event),
}

impl ClientMessage {
    /// Serialize to a JSON array for sending to a relay.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames serialize as arrays, not tagged objects, so the enum
/// carries a hand-written impl instead of a derive.
impl Serialize for ClientMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ClientMessage::Event(event) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(event)?;
                seq.end()
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut seq = serializer.serialize_seq(Some(2 + filters.len()))?;
                seq.serialize_element("REQ")?;
                seq.serialize_element(subscription_id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
                seq.end()
            }
            ClientMessage::Close { subscription_id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("CLOSE")?;
                seq.serialize_element(subscription_id)?;
                seq.end()
            }
            ClientMessage::Auth(event) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("AUTH")?;
                seq.serialize_element(event)?;
                seq.end()
            }
        }
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// Event matching a subscription: `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Publish acknowledgment: `["OK", <event_id>, <true|false>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },

    /// End of stored events: `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },

    /// Subscription closed by relay: `["CLOSED", <subscription_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: `["NOTICE", <message>]`
    Notice { message: String },

    /// Authentication challenge: `["AUTH", <challenge>]`
    Auth { challenge: String },
}

impl RelayMessage {
    /// Parse a JSON frame from the relay.
    pub fn from_json(json: &str) -> Result<Self> {
        let arr: Vec<Value> = serde_json::from_str(json)
            .map_err(|e| ClientError::Protocol(format!("invalid frame: {e}")))?;

        if arr.is_empty() {
            return Err(ClientError::Protocol("empty array".to_string()));
        }

        let msg_type = arr[0]
            .as_str()
            .ok_or_else(|| ClientError::Protocol("first element not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(ClientError::Protocol(
                        "EVENT requires subscription_id and event".to_string(),
                    ));
                }
                let subscription_id = str_field(&arr[1], "subscription_id")?;
                let event: Event = serde_json::from_value(arr[2].clone())
                    .map_err(|e| ClientError::Protocol(format!("malformed event: {e}")))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                if arr.len() < 4 {
                    return Err(ClientError::Protocol("OK requires 4 elements".to_string()));
                }
                let event_id = str_field(&arr[1], "event_id")?;
                let accepted = arr[2]
                    .as_bool()
                    .ok_or_else(|| ClientError::Protocol("OK accepted not a boolean".to_string()))?;
                let message = arr[3].as_str().unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => {
                if arr.len() < 2 {
                    return Err(ClientError::Protocol(
                        "EOSE requires subscription_id".to_string(),
                    ));
                }
                let subscription_id = str_field(&arr[1], "subscription_id")?;
                Ok(RelayMessage::Eose { subscription_id })
            }
            "CLOSED" => {
                if arr.len() < 3 {
                    return Err(ClientError::Protocol(
                        "CLOSED requires subscription_id and message".to_string(),
                    ));
                }
                let subscription_id = str_field(&arr[1], "subscription_id")?;
                let message = arr[2].as_str().unwrap_or("").to_string();
                Ok(RelayMessage::Closed {
                    subscription_id,
                    message,
                })
            }
            "NOTICE" => {
                if arr.len() < 2 {
                    return Err(ClientError::Protocol("NOTICE requires message".to_string()));
                }
                let message = str_field(&arr[1], "message")?;
                Ok(RelayMessage::Notice { message })
            }
            "AUTH" => {
                if arr.len() < 2 {
                    return Err(ClientError::Protocol("AUTH requires challenge".to_string()));
                }
                let challenge = str_field(&arr[1], "challenge")?;
                Ok(RelayMessage::Auth { challenge })
            }
            other => Err(ClientError::Protocol(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

fn str_field(value: &Value, name: &str) -> Result<String> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ClientError::Protocol(format!("{name} not a string")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_client_message_req() {
        let filter = Filter::new().kinds(vec![34236]).limit(10);

        let msg = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filters: vec![filter],
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains("REQ"));
        assert!(json.contains("sub1"));
        assert!(json.contains("kinds"));
    }

    #[test]
    fn test_client_message_close() {
        let msg = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };

        assert_eq!(msg.to_json().unwrap(), r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn test_client_message_auth_wraps_event() {
        let event = Event {
            id: "abc".to_string(),
            pubkey: "pk".to_string(),
            created_at: 123,
            kind: 22242,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        };
        let json = ClientMessage::Auth(event).to_json().unwrap();
        assert!(json.starts_with(r#"["AUTH","#));
        assert!(json.contains("22242"));
    }

    #[test]
    fn test_relay_message_event() {
        let json = r#"["EVENT","sub1",{"id":"abc","pubkey":"pk","created_at":123,"kind":1,"tags":[],"content":"hello","sig":"sig"}]"#;
        let msg = RelayMessage::from_json(json).unwrap();

        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(event.id, "abc");
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_ok_rejected() {
        let json = r#"["OK","event123",false,"duplicate: already have this event"]"#;
        let msg = RelayMessage::from_json(json).unwrap();

        match msg {
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                assert_eq!(event_id, "event123");
                assert!(!accepted);
                assert!(message.contains("duplicate"));
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_eose() {
        let msg = RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap();
        match msg {
            RelayMessage::Eose { subscription_id } => assert_eq!(subscription_id, "sub1"),
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_closed() {
        let msg =
            RelayMessage::from_json(r#"["CLOSED","sub1","error: too many subscriptions"]"#)
                .unwrap();
        match msg {
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert!(message.contains("too many"));
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_notice_and_auth() {
        match RelayMessage::from_json(r#"["NOTICE","rate limited"]"#).unwrap() {
            RelayMessage::Notice { message } => assert_eq!(message, "rate limited"),
            _ => panic!("wrong message type"),
        }
        match RelayMessage::from_json(r#"["AUTH","challenge123"]"#).unwrap() {
            RelayMessage::Auth { challenge } => assert_eq!(challenge, "challenge123"),
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_invalid_frames_are_protocol_errors() {
        for bad in ["not valid json", "[]", r#"["UNKNOWN"]"#, r#"[42,"x"]"#] {
            match RelayMessage::from_json(bad) {
                Err(ClientError::Protocol(_)) => {}
                other => panic!("expected protocol error for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_event_frame_with_malformed_event_is_rejected() {
        let json = r#"["EVENT","sub1",{"id":"abc"}]"#;
        assert!(RelayMessage::from_json(json).is_err());
    }
}
