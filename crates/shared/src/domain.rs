use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(TopicId);
id_newtype!(ConversationId);
id_newtype!(RoomId);
id_newtype!(FileId);

/// An isolated message scope. Each surface owns its own store, cursor and typing set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SurfaceId {
    Topic(TopicId),
    Conversation(ConversationId),
    Room(RoomId),
}

impl SurfaceId {
    pub fn kind(&self) -> SurfaceKind {
        match self {
            Self::Topic(_) => SurfaceKind::Topic,
            Self::Conversation(_) => SurfaceKind::Conversation,
            Self::Room(_) => SurfaceKind::Room,
        }
    }

    pub fn raw_id(&self) -> i64 {
        match self {
            Self::Topic(id) => id.0,
            Self::Conversation(id) => id.0,
            Self::Room(id) => id.0,
        }
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.raw_id())
    }
}

/// Parses the `kind:id` form produced by `Display`.
impl FromStr for SurfaceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected kind:id, got {s:?}"))?;
        let id: i64 = id
            .trim()
            .parse()
            .map_err(|_| format!("invalid surface id {id:?}"))?;
        match kind.trim() {
            "topic" => Ok(Self::Topic(TopicId(id))),
            "conversation" => Ok(Self::Conversation(ConversationId(id))),
            "room" => Ok(Self::Room(RoomId(id))),
            other => Err(format!("unknown surface kind {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    Topic,
    Conversation,
    Room,
}

impl SurfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Conversation => "conversation",
            Self::Room => "room",
        }
    }

    /// Path segment used by the request/response API.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::Topic => "topics",
            Self::Conversation => "conversations",
            Self::Room => "rooms",
        }
    }
}

/// Client-minted token linking an optimistic record to its server confirmation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(pub String);

impl CorrelationKey {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
