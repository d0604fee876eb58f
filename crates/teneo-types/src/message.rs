//! Wire messages exchanged over the session transport.
//!
//! The routing backend speaks framed JSON. Every frame carries a `type`
//! discriminator plus a loose bag of optional fields; the room-routing
//! fields (`room`, `dataRoom`, `messageRoomId`) are carried through
//! unchanged so the backend can disambiguate rooms on its side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Discriminator for session frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Task,
    TaskResult,
    TaskResponse,
    Heartbeat,
    Registration,
    Auth,
    Challenge,
    RequestChallenge,
    AuthSuccess,
    AuthError,
    Register,
    Capabilities,
    Ping,
    Pong,
    Message,
    AgentSelected,
    Join,
    Leave,
    Agents,
    Rooms,
    Nick,
    AgentError,
    TriggerWalletTx,
    TxResult,
    /// Anything this SDK version does not know. Logged and dropped.
    #[serde(other)]
    Unknown,
}

/// One framed session message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(
        default,
        rename = "dataRoom",
        skip_serializing_if = "Option::is_none"
    )]
    pub data_room: Option<String>,
    #[serde(
        default,
        rename = "messageRoomId",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_room_id: Option<String>,
    #[serde(
        default,
        rename = "publicKey",
        skip_serializing_if = "Option::is_none"
    )]
    pub public_key: Option<String>,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Unknown
    }
}

impl Message {
    /// A bare frame of the given type with everything else unset.
    pub fn of_type(message_type: MessageType) -> Self {
        Self {
            message_type,
            timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// The effective routing room, preferring the most specific field the
    /// backend populated.
    pub fn effective_room(&self) -> Option<&str> {
        self.room
            .as_deref()
            .or(self.data_room.as_deref())
            .or(self.message_room_id.as_deref())
    }
}

/// Outbound `auth` payload sent after receiving a challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub address: String,
    pub signature: String,
    pub message: String,
    #[serde(rename = "userType")]
    pub user_type: String,
    #[serde(rename = "agentName", skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(rename = "nft_token_id", skip_serializing_if = "Option::is_none")]
    pub nft_token_id: Option<String>,
    pub timestamp: i64,
}

/// Inbound `challenge` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeMessage {
    pub challenge: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Outbound `register` payload sent after `auth_success`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationMessage {
    #[serde(rename = "userType")]
    pub user_type: String,
    #[serde(rename = "nft_token_id")]
    pub nft_token_id: String,
    pub wallet_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub challenge: String,
    pub challenge_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

/// Payload of `agent_error` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentErrorData {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

/// A transaction the end user is asked to sign in their own wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRequest {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "chainId")]
    pub chain_id: u64,
}

/// Payload of `trigger_wallet_tx` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerWalletTxData {
    pub task_id: String,
    pub tx: TxRequest,
    pub description: String,
    pub optional: bool,
}

/// Payload received on `tx_result` when the user responded to a wallet
/// transaction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResultData {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Content kind tag used in standardized response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    String,
    Array,
    Markdown,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Json => "JSON",
            ContentKind::String => "STRING",
            ContentKind::Array => "ARRAY",
            ContentKind::Markdown => "MD",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_deserializes() {
        let frame: Message =
            serde_json::from_str(r#"{"type":"brand_new_thing","content":"x"}"#).unwrap();
        assert_eq!(frame.message_type, MessageType::Unknown);
    }

    #[test]
    fn test_routing_fields_round_trip() {
        let raw = r#"{"type":"task","task_id":"t-1","room":"r1","dataRoom":"r2","messageRoomId":"r3"}"#;
        let frame: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.effective_room(), Some("r1"));

        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"dataRoom\":\"r2\""));
        assert!(encoded.contains("\"messageRoomId\":\"r3\""));
    }

    #[test]
    fn test_effective_room_fallback_order() {
        let mut frame = Message::of_type(MessageType::Task);
        assert_eq!(frame.effective_room(), None);
        frame.message_room_id = Some("m".into());
        assert_eq!(frame.effective_room(), Some("m"));
        frame.data_room = Some("d".into());
        assert_eq!(frame.effective_room(), Some("d"));
        frame.room = Some("r".into());
        assert_eq!(frame.effective_room(), Some("r"));
    }

    #[test]
    fn test_type_tag_spellings() {
        assert_eq!(
            serde_json::to_string(&MessageType::RequestChallenge).unwrap(),
            "\"request_challenge\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::TriggerWalletTx).unwrap(),
            "\"trigger_wallet_tx\""
        );
    }
}
