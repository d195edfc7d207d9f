use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 总线事件 / Bus event
///
/// 所有跨actor扇出都以该结构承载，载荷为JSON值
/// All cross-actor fan-out is carried by this structure with a JSON payload
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl BusEvent {
    pub fn new(topic: &str, kind: &str, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.to_string(),
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// 主题命名方案，作为稳定契约 / Topic naming scheme, a stable contract
pub mod topics {
    pub fn workspace(id: &str) -> String {
        format!("workspace:{}", id)
    }

    pub fn channel_messages(id: &str) -> String {
        format!("channel:{}:messages", id)
    }

    pub fn channel_typing(id: &str) -> String {
        format!("channel:{}:typing", id)
    }

    pub fn channel_members(id: &str) -> String {
        format!("channel:{}:members", id)
    }

    pub fn user_presence(user_id: &str) -> String {
        format!("user:{}:presence", user_id)
    }

    pub fn user_notifications(user_id: &str) -> String {
        format!("user:{}:notifications", user_id)
    }

    pub const PRESENCE: &str = "presence";
    pub const UPLOADS: &str = "uploads";
    pub const NOTIFICATIONS: &str = "notifications";
}

/// 事件种类名 / Event kind names
pub mod kinds {
    pub const NEW_MESSAGE: &str = "new_message";
    pub const MESSAGE_EDITED: &str = "message_edited";
    pub const MESSAGE_DELETED: &str = "message_deleted";
    pub const TYPING_CHANGED: &str = "typing_changed";
    pub const MEMBER_JOINED: &str = "member_joined";
    pub const MEMBER_LEFT: &str = "member_left";
    pub const REACTION_ADDED: &str = "reaction_added";
    pub const REACTION_REMOVED: &str = "reaction_removed";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const WORKSPACE_UPDATED: &str = "workspace_updated";
    pub const WORKSPACE_BROADCAST: &str = "workspace_broadcast";
    pub const UPLOAD_COMPLETED: &str = "upload_completed";
    pub const UPLOAD_FAILED: &str = "upload_failed";
    pub const UPLOAD_CANCELLED: &str = "upload_cancelled";
    pub const NOTIFICATION: &str = "notification";
}
