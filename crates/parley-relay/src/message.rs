use serde_json::{json, Value};

use parley_core::error::ParleyError;
use parley_core::event::Event;
use parley_core::filter::Filter;

/// Messages a client sends to a relay. Wire form is a JSON array whose first
/// element names the verb.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req { sub_id, filters } => {
                let mut arr = vec![json!("REQ"), json!(sub_id)];
                arr.extend(filters.iter().map(|f| json!(f)));
                Value::Array(arr)
            }
            ClientMessage::Close { sub_id } => json!(["CLOSE", sub_id]),
        };
        value.to_string()
    }

    pub fn from_json(raw: &str) -> Result<Self, ParleyError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ParleyError::Parse(format!("client message: {e}")))?;
        let arr = value
            .as_array()
            .ok_or_else(|| ParleyError::Parse("client message is not an array".into()))?;
        match arr.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let event = serde_json::from_value(
                    arr.get(1).cloned().unwrap_or(Value::Null),
                )
                .map_err(|e| ParleyError::Parse(format!("EVENT payload: {e}")))?;
                Ok(ClientMessage::Event(event))
            }
            Some("REQ") => {
                let sub_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ParleyError::Parse("REQ missing sub id".into()))?
                    .to_string();
                let filters = arr[2..]
                    .iter()
                    .map(|v| serde_json::from_value(v.clone()))
                    .collect::<Result<Vec<Filter>, _>>()
                    .map_err(|e| ParleyError::Parse(format!("REQ filter: {e}")))?;
                Ok(ClientMessage::Req { sub_id, filters })
            }
            Some("CLOSE") => {
                let sub_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ParleyError::Parse("CLOSE missing sub id".into()))?
                    .to_string();
                Ok(ClientMessage::Close { sub_id })
            }
            other => Err(ParleyError::Parse(format!("unknown client verb {other:?}"))),
        }
    }
}

/// Messages a relay sends to a client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Ok { event_id: String, accepted: bool, message: String },
    Eose { sub_id: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
}

impl RelayMessage {
    pub fn to_json(&self) -> String {
        match self {
            RelayMessage::Event { sub_id, event } => json!(["EVENT", sub_id, event]).to_string(),
            RelayMessage::Ok { event_id, accepted, message } => {
                json!(["OK", event_id, accepted, message]).to_string()
            }
            RelayMessage::Eose { sub_id } => json!(["EOSE", sub_id]).to_string(),
            RelayMessage::Closed { sub_id, message } => {
                json!(["CLOSED", sub_id, message]).to_string()
            }
            RelayMessage::Notice { message } => json!(["NOTICE", message]).to_string(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ParleyError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ParleyError::Parse(format!("relay message: {e}")))?;
        let arr = value
            .as_array()
            .ok_or_else(|| ParleyError::Parse("relay message is not an array".into()))?;
        let str_at = |i: usize| arr.get(i).and_then(Value::as_str).map(str::to_string);

        match arr.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let sub_id = str_at(1)
                    .ok_or_else(|| ParleyError::Parse("EVENT missing sub id".into()))?;
                let event = serde_json::from_value(
                    arr.get(2).cloned().unwrap_or(Value::Null),
                )
                .map_err(|e| ParleyError::Parse(format!("EVENT payload: {e}")))?;
                Ok(RelayMessage::Event { sub_id, event })
            }
            Some("OK") => Ok(RelayMessage::Ok {
                event_id: str_at(1)
                    .ok_or_else(|| ParleyError::Parse("OK missing event id".into()))?,
                accepted: arr.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: str_at(3).unwrap_or_default(),
            }),
            Some("EOSE") => Ok(RelayMessage::Eose {
                sub_id: str_at(1)
                    .ok_or_else(|| ParleyError::Parse("EOSE missing sub id".into()))?,
            }),
            Some("CLOSED") => Ok(RelayMessage::Closed {
                sub_id: str_at(1)
                    .ok_or_else(|| ParleyError::Parse("CLOSED missing sub id".into()))?,
                message: str_at(2).unwrap_or_default(),
            }),
            Some("NOTICE") => Ok(RelayMessage::Notice {
                message: str_at(1).unwrap_or_default(),
            }),
            other => Err(ParleyError::Parse(format!("unknown relay verb {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::types::{EventId, Pubkey, Signature};

    fn sample_event() -> Event {
        Event {
            id: EventId::from_bytes([1; 32]),
            pubkey: Pubkey::from_bytes([2; 32]),
            created_at: 10,
            kind: 20174,
            tags: vec![],
            content: "hi".into(),
            sig: Signature::from_bytes([3; 64]),
        }
    }

    #[test]
    fn req_round_trip() {
        let msg = ClientMessage::Req {
            sub_id: "sub1".into(),
            filters: vec![Filter::new().kinds(vec![20174])],
        };
        let json = msg.to_json();
        assert!(json.starts_with("[\"REQ\",\"sub1\","));
        match ClientMessage::from_json(&json).unwrap() {
            ClientMessage::Req { sub_id, filters } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(filters.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn event_round_trip_both_directions() {
        let ev = sample_event();
        let client = ClientMessage::Event(ev.clone()).to_json();
        assert!(matches!(
            ClientMessage::from_json(&client).unwrap(),
            ClientMessage::Event(e) if e == ev
        ));

        let relay = RelayMessage::Event { sub_id: "s".into(), event: ev.clone() }.to_json();
        assert!(matches!(
            RelayMessage::from_json(&relay).unwrap(),
            RelayMessage::Event { event, .. } if event == ev
        ));
    }

    #[test]
    fn ok_and_eose_parse() {
        let ok = RelayMessage::from_json(r#"["OK","abcd",true,""]"#).unwrap();
        assert!(matches!(ok, RelayMessage::Ok { accepted: true, .. }));

        let eose = RelayMessage::from_json(r#"["EOSE","sub9"]"#).unwrap();
        assert!(matches!(eose, RelayMessage::Eose { sub_id } if sub_id == "sub9"));
    }

    #[test]
    fn unknown_verb_is_an_error() {
        assert!(RelayMessage::from_json(r#"["AUTH","x"]"#).is_err());
    }
}
