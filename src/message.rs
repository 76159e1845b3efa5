//! Wire protocol framing for client and peer messages.
//!
//! Every frame is a JSON array whose first element names the command. Inbound
//! frames are decoded once into [`ClientMessage`] (from clients) or
//! [`RelayMessage`] (from federation peers); outbound frames are built as text
//! so stored raw events are forwarded byte for byte.

use serde_json::Value;

use crate::error::ProtocolError;

/// Message received from a client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["REQ", <name>, <filter>...]`. Filters stay undecoded so each one can
    /// be rejected individually.
    Req { name: String, filters: Vec<Value> },
    /// `["EVENT", <event>]`
    Event(Value),
    /// `["CLOSE", <name>]`
    Close(String),
    /// Any other command name.
    Unknown(String),
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let val: Value = serde_json::from_str(text)?;
        let Value::Array(mut arr) = val else {
            return Err(ProtocolError::NotAnArray);
        };
        let cmd = match arr.first() {
            Some(Value::String(cmd)) => cmd.clone(),
            _ => return Err(ProtocolError::MissingCommand),
        };
        match cmd.as_str() {
            "REQ" => {
                let name = string_arg(&arr, "REQ")?;
                let filters = arr.split_off(2);
                Ok(ClientMessage::Req { name, filters })
            }
            "EVENT" => {
                if arr.len() < 2 {
                    return Err(ProtocolError::MissingArgument {
                        command: "EVENT",
                        what: "an event",
                    });
                }
                Ok(ClientMessage::Event(arr.swap_remove(1)))
            }
            "CLOSE" => Ok(ClientMessage::Close(string_arg(&arr, "CLOSE")?)),
            _ => Ok(ClientMessage::Unknown(cmd)),
        }
    }
}

fn string_arg(arr: &[Value], command: &'static str) -> Result<String, ProtocolError> {
    text_at(arr, 1).ok_or(ProtocolError::MissingArgument {
        command,
        what: "a subscription name",
    })
}

/// Message received from a federation peer.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { subscription: String, event: Value },
    Eose(String),
    Notice(String),
    Other,
}

impl RelayMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let val: Value = serde_json::from_str(text)?;
        let Value::Array(mut arr) = val else {
            return Err(ProtocolError::NotAnArray);
        };
        let cmd = text_at(&arr, 0).ok_or(ProtocolError::MissingCommand)?;
        match cmd.as_str() {
            "EVENT" if arr.len() >= 3 => {
                let subscription = text_at(&arr, 1).ok_or(ProtocolError::MissingArgument {
                    command: "EVENT",
                    what: "a subscription name",
                })?;
                Ok(RelayMessage::Event {
                    subscription,
                    event: arr.swap_remove(2),
                })
            }
            "EOSE" => Ok(text_at(&arr, 1).map_or(RelayMessage::Other, RelayMessage::Eose)),
            "NOTICE" => Ok(text_at(&arr, 1).map_or(RelayMessage::Other, RelayMessage::Notice)),
            _ => Ok(RelayMessage::Other),
        }
    }
}

fn text_at(arr: &[Value], i: usize) -> Option<String> {
    arr.get(i).and_then(Value::as_str).map(str::to_string)
}

fn quoted(s: &str) -> String {
    Value::from(s).to_string()
}

/// `["EVENT", <name>, <raw>]` sent to a subscriber.
pub fn event_frame(subscription: &str, raw: &str) -> String {
    format!("[\"EVENT\",{},{}]", quoted(subscription), raw)
}

/// `["EVENT", <raw>]` published to a peer.
pub fn publish_frame(raw: &str) -> String {
    format!("[\"EVENT\",{}]", raw)
}

pub fn eose_frame(subscription: &str) -> String {
    format!("[\"EOSE\",{}]", quoted(subscription))
}

pub fn notice_frame(message: &str) -> String {
    format!("[\"NOTICE\",{}]", quoted(message))
}

/// `["REQ", <name>, <filter>...]` sent to a peer.
pub fn req_frame(subscription: &str, filters: &[Value]) -> String {
    let mut arr = vec![Value::from("REQ"), Value::from(subscription)];
    arr.extend(filters.iter().cloned());
    Value::Array(arr).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_req_with_filters() {
        let msg = ClientMessage::decode(r##"["REQ","sub",{"kinds":[1]},{"#t":["x"]}]"##).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Req {
                name: "sub".into(),
                filters: vec![json!({"kinds": [1]}), json!({"#t": ["x"]})],
            }
        );
        let msg = ClientMessage::decode(r#"["REQ","empty"]"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Req {
                name: "empty".into(),
                filters: vec![],
            }
        );
    }

    #[test]
    fn decode_event_and_close() {
        let msg = ClientMessage::decode(r#"["EVENT",{"id":"x"}]"#).unwrap();
        assert_eq!(msg, ClientMessage::Event(json!({"id": "x"})));
        let msg = ClientMessage::decode(r#"["CLOSE","sub"]"#).unwrap();
        assert_eq!(msg, ClientMessage::Close("sub".into()));
    }

    #[test]
    fn decode_unknown_command() {
        let msg = ClientMessage::decode(r#"["AUTH","challenge"]"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown("AUTH".into()));
    }

    #[test]
    fn decode_errors() {
        assert!(matches!(
            ClientMessage::decode("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            ClientMessage::decode(r#"{"REQ":1}"#),
            Err(ProtocolError::NotAnArray)
        ));
        assert!(matches!(
            ClientMessage::decode("[]"),
            Err(ProtocolError::MissingCommand)
        ));
        assert!(matches!(
            ClientMessage::decode("[1]"),
            Err(ProtocolError::MissingCommand)
        ));
        assert!(matches!(
            ClientMessage::decode(r#"["REQ"]"#),
            Err(ProtocolError::MissingArgument { command: "REQ", .. })
        ));
        assert!(matches!(
            ClientMessage::decode(r#"["CLOSE",5]"#),
            Err(ProtocolError::MissingArgument { command: "CLOSE", .. })
        ));
        assert!(matches!(
            ClientMessage::decode(r#"["EVENT"]"#),
            Err(ProtocolError::MissingArgument { command: "EVENT", .. })
        ));
    }

    #[test]
    fn decode_relay_messages() {
        let msg = RelayMessage::decode(r#"["EVENT","s",{"id":"x"}]"#).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Event {
                subscription: "s".into(),
                event: json!({"id": "x"}),
            }
        );
        assert_eq!(
            RelayMessage::decode(r#"["EOSE","s"]"#).unwrap(),
            RelayMessage::Eose("s".into())
        );
        assert_eq!(
            RelayMessage::decode(r#"["NOTICE","slow down"]"#).unwrap(),
            RelayMessage::Notice("slow down".into())
        );
        assert_eq!(
            RelayMessage::decode(r#"["OK","id",true,""]"#).unwrap(),
            RelayMessage::Other
        );
    }

    #[test]
    fn frames_are_valid_json() {
        let raw = r#"{"id":"x","kind":1}"#;
        let v: Value = serde_json::from_str(&event_frame("a\"b", raw)).unwrap();
        assert_eq!(v, json!(["EVENT", "a\"b", {"id": "x", "kind": 1}]));
        let v: Value = serde_json::from_str(&publish_frame(raw)).unwrap();
        assert_eq!(v, json!(["EVENT", {"id": "x", "kind": 1}]));
        let v: Value = serde_json::from_str(&eose_frame("s")).unwrap();
        assert_eq!(v, json!(["EOSE", "s"]));
        let v: Value = serde_json::from_str(&notice_frame("bad\nthing")).unwrap();
        assert_eq!(v, json!(["NOTICE", "bad\nthing"]));
        let v: Value = serde_json::from_str(&req_frame("s", &[json!({"since": 5})])).unwrap();
        assert_eq!(v, json!(["REQ", "s", {"since": 5}]));
    }
}
