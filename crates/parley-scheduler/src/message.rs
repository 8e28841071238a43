use serde::{Deserialize, Serialize};

use parley_core::error::ParleyError;
use parley_core::event::Event;

/// A dispatched expert job. The scheduler owns the secrets; the worker
/// receives exactly what it needs to run the persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub expert_type: String,
    /// Hex secret key the worker signs expert events with.
    pub expert_privkey: String,
    /// Wallet connection string for invoicing.
    pub wallet_nwc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstore_id: Option<String>,
    /// Free-form persona settings (nickname, hashtags, model hints).
    #[serde(default)]
    pub env: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Starting,
    Running,
    Stopped,
    Failed,
}

/// Frames on the scheduler↔worker channel, JSON-encoded, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Worker handshake: identity plus supported expert types.
    Hello { worker_id: String, expert_types: Vec<String> },
    HelloAck,
    Ping { seq: u64 },
    Pong { seq: u64 },
    Dispatch { job: Job },
    JobAccepted { job_id: String },
    JobRejected { job_id: String, reason: String },
    JobStatus { job_id: String, state: JobState, detail: Option<String> },
    /// A signed expert event for the scheduler to publish.
    PublishEvent { job_id: String, event: Event },
    Cancel { job_id: String },
    CancelAck { job_id: String },
}

impl WireMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("wire message serialization is infallible")
    }

    pub fn from_json(raw: &str) -> Result<Self, ParleyError> {
        serde_json::from_str(raw).map_err(|e| ParleyError::Parse(format!("wire message: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_round_trip() {
        let msg = WireMessage::Dispatch {
            job: Job {
                job_id: "j1".into(),
                expert_type: "rag".into(),
                expert_privkey: "ab".repeat(32),
                wallet_nwc: "nostr+walletconnect://...".into(),
                docstore_id: Some("ds1".into()),
                env: serde_json::json!({ "nickname": "atlas" }),
            },
        };
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"dispatch\""));
        match WireMessage::from_json(&json).unwrap() {
            WireMessage::Dispatch { job } => {
                assert_eq!(job.job_id, "j1");
                assert_eq!(job.expert_type, "rag");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        assert!(WireMessage::from_json(r#"{"type":"teleport"}"#).is_err());
    }
}
