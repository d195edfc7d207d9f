use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// 频道消息 / Channel message
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub mentions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reactions: Vec<ReactionSummary>,
    pub metadata: serde_json::Value,
}

impl ChatMessage {
    /// 构造新消息，分配ID与时间戳 / Build a new message with id and timestamp
    pub fn new(channel_id: &str, user_id: &str, content: &str, metadata: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            mentions: extract_mentions(content),
            parent_message_id: None,
            edited_at: None,
            attachments: Vec::new(),
            reactions: Vec::new(),
            metadata,
        }
    }
}

/// 表情回应汇总 / Reaction summary on a message
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<String>,
}

lazy_static::lazy_static! {
    static ref MENTION_RE: regex::Regex =
        regex::Regex::new(r"@([A-Za-z0-9_\-\.]+)").expect("mention regex");
}

/// 提取@提及 / Extract @mentions from message content
pub fn extract_mentions(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    MENTION_RE
        .captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|m| seen.insert(m.clone()))
        .collect()
}

/// 待持久化的缓冲消息 / Buffered message awaiting durable write
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BufferedMessage {
    pub message_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub content: String,
    pub buffered_at: i64,
    pub metadata: serde_json::Value,
}

/// 成员条目，频道与工作区共用同一形状 / Member entry, same shape for channel and workspace
#[derive(Debug, Clone)]
pub struct MemberEntry {
    pub user_id: String,
    pub joined_at: i64,
    pub last_activity: i64,
    pub connections: HashSet<String>,
}

impl MemberEntry {
    pub fn new(user_id: &str, conn_id: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        let mut connections = HashSet::new();
        connections.insert(conn_id.to_string());
        Self {
            user_id: user_id.to_string(),
            joined_at: now,
            last_activity: now,
            connections,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now().timestamp_millis();
    }
}

/// 在线状态 / Presence status
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// 在线状态记录 / Presence record
///
/// 不变式：连接集为空的记录不得保持Online/Away
/// Invariant: a record with an empty connection set must not stay Online/Away
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: i64,
    pub connections: HashSet<String>,
    pub metadata: serde_json::Value,
}

/// 对外的在线状态快照 / Externally visible presence snapshot
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PresenceSnapshot {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: i64,
    pub connection_count: usize,
    pub metadata: serde_json::Value,
}

impl PresenceRecord {
    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            user_id: self.user_id.clone(),
            status: self.status,
            last_seen: self.last_seen,
            connection_count: self.connections.len(),
            metadata: self.metadata.clone(),
        }
    }
}

/// 通知类型 / Notification kind
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Push,
    Email,
    InApp,
    Webhook,
}

/// 通知优先级 / Notification priority
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// 通知记录 / Notification record
///
/// 生命周期：queued → processing → {sent | requeued | failed}
/// Lifecycle: queued → processing → {sent | requeued | failed}
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub recipient_id: String,
    pub payload: serde_json::Value,
    pub priority: NotificationPriority,
    pub retry_count: u32,
    pub created_at: i64,
    /// 早于此时刻不投递 / Not delivered before this instant
    pub scheduled_for: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// 入队选项 / Enqueue options
#[derive(Debug, Clone, Default)]
pub struct NotifyOptions {
    pub priority: NotificationPriority,
    pub scheduled_for: Option<i64>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        recipient_id: &str,
        payload: serde_json::Value,
        opts: NotifyOptions,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            recipient_id: recipient_id.to_string(),
            payload,
            priority: opts.priority,
            retry_count: 0,
            created_at: now,
            scheduled_for: opts.scheduled_for.unwrap_or(now),
            last_error: None,
        }
    }
}

/// 上传任务状态 / Upload job status
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    /// 终态失败，reason为virus_detected时表示已隔离 / Terminal failure; virus_detected means quarantined
    Failed { reason: String },
    Cancelled,
}

/// 上传任务优先级 / Upload job priority
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
}

/// 上传处理选项 / Upload processing options
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub submitter_id: Option<String>,
    pub priority: JobPriority,
    pub generate_thumbnail: bool,
}

/// 上传任务 / Upload job
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: String,
    pub upload_id: String,
    pub file_path: String,
    pub options: UploadOptions,
    pub status: JobStatus,
    pub retry_count: u32,
    pub submitted_at: i64,
}

impl UploadJob {
    pub fn new(upload_id: &str, file_path: &str, options: UploadOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            upload_id: upload_id.to_string(),
            file_path: file_path.to_string(),
            options,
            status: JobStatus::Queued,
            retry_count: 0,
            submitted_at: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_mentions() {
        let mentions = extract_mentions("hey @alice and @bob, ping @alice again");
        assert_eq!(mentions, vec!["alice".to_string(), "bob".to_string()]);
        assert!(extract_mentions("no mentions here").is_empty());
    }

    #[test]
    fn test_new_message_assigns_id_and_mentions() {
        let msg = ChatMessage::new("ch-1", "u-1", "hello @carol", serde_json::json!({}));
        assert!(!msg.id.is_empty());
        assert!(msg.timestamp > 0);
        assert_eq!(msg.mentions, vec!["carol".to_string()]);
    }
}
