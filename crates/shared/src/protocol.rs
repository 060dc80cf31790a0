use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GroupEventKind, GroupId, MessageType, WalletAddress};

/// Message shape as the provider delivers it on its event sources and in
/// history responses. Field aliases cover the provider's older spellings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(alias = "chatId")]
    pub group_id: String,
    #[serde(default, alias = "cid", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(alias = "fromDID")]
    pub from: String,
    #[serde(alias = "messageContent")]
    pub content: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message_type: MessageType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEventPayload {
    #[serde(alias = "chatId")]
    pub group_id: String,
    pub kind: GroupEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundPayload {
    ChatMessage(MessagePayload),
    GroupEvent(GroupEventPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub members: Vec<WalletAddress>,
    #[serde(default)]
    pub admins: Vec<WalletAddress>,
    #[serde(default)]
    pub is_public: bool,
}

impl CreateGroupRequest {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            members: Vec::new(),
            admins: Vec::new(),
            is_public: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub members: Vec<WalletAddress>,
    #[serde(default)]
    pub admins: Vec<WalletAddress>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_chat_message_with_provider_aliases() {
        let raw = serde_json::json!({
            "event": "chat_message",
            "chatId": "table-1",
            "cid": "m1",
            "fromDID": "0xABC",
            "messageContent": "hi",
            "timestamp": 1_700_000_000_000_i64,
            "messageType": "Text",
        });

        let parsed: InboundPayload = serde_json::from_value(raw).expect("parse");
        match parsed {
            InboundPayload::ChatMessage(message) => {
                assert_eq!(message.group_id, "table-1");
                assert_eq!(message.message_id.as_deref(), Some("m1"));
                assert_eq!(message.content, "hi");
                assert_eq!(message.message_type, MessageType::Text);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_maps_to_unknown() {
        let raw = serde_json::json!({
            "groupId": "table-1",
            "from": "0xabc",
            "content": "{}",
            "messageType": "Payment",
        });

        let parsed: MessagePayload = serde_json::from_value(raw).expect("parse");
        assert_eq!(parsed.message_type, MessageType::Unknown);
        assert!(parsed.message_id.is_none());
    }

    #[test]
    fn wallet_address_normalizes_case() {
        assert_eq!(
            WalletAddress::new("0xAbCd"),
            WalletAddress::new(" 0xabcd ")
        );
    }
}
