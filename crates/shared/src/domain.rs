use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(PendingWriteId);

/// Client-generated key that makes a create operation idempotent before the
/// server has assigned an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(pub Uuid);

impl CorrelationKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    SendMessage,
    ToggleLike,
    IncrementView,
    MarkRead,
}

impl WriteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteKind::SendMessage => "send_message",
            WriteKind::ToggleLike => "toggle_like",
            WriteKind::IncrementView => "increment_view",
            WriteKind::MarkRead => "mark_read",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "send_message" => Some(WriteKind::SendMessage),
            "toggle_like" => Some(WriteKind::ToggleLike),
            "increment_view" => Some(WriteKind::IncrementView),
            "mark_read" => Some(WriteKind::MarkRead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    ColdStart,
    AppForeground,
    NetworkRestored,
    PushWake,
    Manual,
}

impl WakeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            WakeReason::ColdStart => "cold_start",
            WakeReason::AppForeground => "app_foreground",
            WakeReason::NetworkRestored => "network_restored",
            WakeReason::PushWake => "push_wake",
            WakeReason::Manual => "manual",
        }
    }
}
