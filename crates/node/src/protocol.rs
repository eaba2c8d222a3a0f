//! Agreement protocol messages exchanged with agbots through the exchange.
//!
//! Every message is a JSON object tagged by `"type"`. Messages are relayed to
//! the governance worker as [`Message::ExchangeDeviceMessage`] and decoded
//! here.
//!
//! [`Message::ExchangeDeviceMessage`]: anax_common::Message::ExchangeDeviceMessage

use serde::{Deserialize, Serialize};

use crate::policy::{PolicyError, Proposal};

/// Sender details that accompany a relayed protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub message_id: u64,
    pub agbot_id: String,
    pub agbot_pubkey: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    Proposal(Proposal),
    /// The node's answer to a proposal.
    Reply {
        agreement_id: String,
        protocol: String,
        decision: bool,
        device_id: String,
    },
    /// The agbot confirms (or withdraws) the agreement after our reply.
    ReplyAck {
        agreement_id: String,
        protocol: String,
        still_valid: bool,
    },
    DataReceived {
        agreement_id: String,
        protocol: String,
    },
    DataReceivedAck {
        agreement_id: String,
        protocol: String,
    },
    Metering {
        agreement_id: String,
        protocol: String,
        #[serde(default)]
        amount: u64,
    },
    Cancel {
        agreement_id: String,
        protocol: String,
        reason: u64,
    },
    /// Ask the other side whether it still knows about an agreement.
    AgreementVerify {
        agreement_id: String,
        protocol: String,
    },
    AgreementVerifyReply {
        agreement_id: String,
        protocol: String,
        exists: bool,
    },
}

impl ProtocolMessage {
    pub fn demarshal(raw: &str) -> Result<ProtocolMessage, PolicyError> {
        serde_json::from_str(raw).map_err(|e| PolicyError::Demarshal(e.to_string()))
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn agreement_id(&self) -> &str {
        match self {
            ProtocolMessage::Proposal(p) => &p.agreement_id,
            ProtocolMessage::Reply { agreement_id, .. }
            | ProtocolMessage::ReplyAck { agreement_id, .. }
            | ProtocolMessage::DataReceived { agreement_id, .. }
            | ProtocolMessage::DataReceivedAck { agreement_id, .. }
            | ProtocolMessage::Metering { agreement_id, .. }
            | ProtocolMessage::Cancel { agreement_id, .. }
            | ProtocolMessage::AgreementVerify { agreement_id, .. }
            | ProtocolMessage::AgreementVerifyReply { agreement_id, .. } => agreement_id,
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            ProtocolMessage::Proposal(p) => &p.protocol,
            ProtocolMessage::Reply { protocol, .. }
            | ProtocolMessage::ReplyAck { protocol, .. }
            | ProtocolMessage::DataReceived { protocol, .. }
            | ProtocolMessage::DataReceivedAck { protocol, .. }
            | ProtocolMessage::Metering { protocol, .. }
            | ProtocolMessage::Cancel { protocol, .. }
            | ProtocolMessage::AgreementVerify { protocol, .. }
            | ProtocolMessage::AgreementVerifyReply { protocol, .. } => protocol,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Proposal(_) => "proposal",
            ProtocolMessage::Reply { .. } => "reply",
            ProtocolMessage::ReplyAck { .. } => "reply_ack",
            ProtocolMessage::DataReceived { .. } => "data_received",
            ProtocolMessage::DataReceivedAck { .. } => "data_received_ack",
            ProtocolMessage::Metering { .. } => "metering",
            ProtocolMessage::Cancel { .. } => "cancel",
            ProtocolMessage::AgreementVerify { .. } => "agreement_verify",
            ProtocolMessage::AgreementVerifyReply { .. } => "agreement_verify_reply",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_wire_form() {
        let raw = r#"{"type":"reply_ack","agreement_id":"ag1","protocol":"Basic","still_valid":false}"#;
        let msg = ProtocolMessage::demarshal(raw).unwrap();
        assert_eq!(msg.kind(), "reply_ack");
        assert_eq!(msg.agreement_id(), "ag1");
        assert!(matches!(msg, ProtocolMessage::ReplyAck { still_valid: false, .. }));
    }

    #[test]
    fn test_proposal_carries_its_own_fields() {
        let raw = serde_json::json!({
            "type": "proposal",
            "agreement_id": "ag9",
            "protocol": "Basic",
            "version": 2,
            "consumer_id": "acme/agbot",
            "ts_and_cs": "{}"
        })
        .to_string();
        let msg = ProtocolMessage::demarshal(&raw).unwrap();
        assert_eq!(msg.protocol(), "Basic");
        match msg {
            ProtocolMessage::Proposal(p) => assert_eq!(p.consumer_id, "acme/agbot"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_fails() {
        assert!(ProtocolMessage::demarshal(r#"{"type":"hello"}"#).is_err());
    }
}
