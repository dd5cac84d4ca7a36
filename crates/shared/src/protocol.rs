use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{CorrelationKey, FileId, MessageId, SurfaceId, UserId},
    error::ApiError,
};

/// Frames the client writes to the persistent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlFrame {
    Authenticate { token: String },
    JoinSurface { surface: SurfaceId },
    LeaveSurface { surface: SurfaceId },
    Typing { surface: SurfaceId, typing: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub file_id: FileId,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Legacy reaction shape: one record per reacting user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReactionRecord {
    pub user_id: UserId,
    pub emoji: String,
}

/// Pre-grouped reaction shape. The `reacted` field is what distinguishes it on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedReaction {
    pub emoji: String,
    pub count: u32,
    #[serde(default)]
    pub users: Vec<UserId>,
    pub reacted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReactionsWire {
    Grouped(Vec<GroupedReaction>),
    Legacy(Vec<UserReactionRecord>),
}

impl Default for ReactionsWire {
    fn default() -> Self {
        Self::Grouped(Vec::new())
    }
}

/// Authoritative message record as returned by requests and carried by events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub surface: SurfaceId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub reactions: ReactionsWire,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_by: Vec<UserId>,
    /// Key of the request that created the message, echoed back to its sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<CorrelationKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub correlation_key: CorrelationKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub correlation_key: CorrelationKey,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessageRequest {
    pub correlation_key: CorrelationKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRequest {
    pub correlation_key: CorrelationKey,
    pub emoji: String,
}

/// Server acknowledgement for a reaction change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionAck {
    pub surface: SurfaceId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<MessagePayload>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: MessagePayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_key: Option<CorrelationKey>,
    },
    MessageEdited {
        surface: SurfaceId,
        message_id: MessageId,
        body: String,
        edited_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_key: Option<CorrelationKey>,
    },
    MessageDeleted {
        surface: SurfaceId,
        message_id: MessageId,
        deleted_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_key: Option<CorrelationKey>,
    },
    ReactionAdded {
        surface: SurfaceId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    ReactionRemoved {
        surface: SurfaceId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
    MessagesRead {
        surface: SurfaceId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },
    UserTyping {
        surface: SurfaceId,
        user_id: UserId,
        typing: bool,
    },
    MembershipChanged {
        surface: SurfaceId,
        user_id: UserId,
        joined: bool,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn surface(&self) -> Option<SurfaceId> {
        match self {
            Self::MessageCreated { message, .. } => Some(message.surface),
            Self::MessageEdited { surface, .. }
            | Self::MessageDeleted { surface, .. }
            | Self::ReactionAdded { surface, .. }
            | Self::ReactionRemoved { surface, .. }
            | Self::MessagesRead { surface, .. }
            | Self::UserTyping { surface, .. }
            | Self::MembershipChanged { surface, .. } => Some(*surface),
            Self::Error(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageCreated { .. } => "message_created",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::ReactionRemoved { .. } => "reaction_removed",
            Self::MessagesRead { .. } => "messages_read",
            Self::UserTyping { .. } => "user_typing",
            Self::MembershipChanged { .. } => "membership_changed",
            Self::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TopicId;

    #[test]
    fn grouped_reactions_are_detected_by_reacted_field() {
        let raw = r#"[{"emoji":"👍","count":2,"users":[1,2],"reacted":true}]"#;
        let parsed: ReactionsWire = serde_json::from_str(raw).expect("grouped");
        assert!(matches!(parsed, ReactionsWire::Grouped(ref groups) if groups.len() == 1));
    }

    #[test]
    fn flat_reactions_fall_back_to_legacy_shape() {
        let raw = r#"[{"user_id":1,"emoji":"👍"},{"user_id":2,"emoji":"❤️"}]"#;
        let parsed: ReactionsWire = serde_json::from_str(raw).expect("legacy");
        assert!(matches!(parsed, ReactionsWire::Legacy(ref records) if records.len() == 2));
    }

    #[test]
    fn server_event_uses_type_and_payload_envelope() {
        let raw = r#"{"type":"user_typing","payload":{"surface":{"kind":"topic","id":3},"user_id":9,"typing":true}}"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("event");
        assert_eq!(event.surface(), Some(SurfaceId::Topic(TopicId(3))));
        assert_eq!(event.name(), "user_typing");
    }
}
