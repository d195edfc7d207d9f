//! 频道actor / Channel actor
//!
//! 单个频道的实时消息广播、输入状态与有界近期消息缓存的唯一属主
//! Sole owner of real-time broadcast, typing state and the bounded
//! recent-message cache for a single channel

use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::bus::SharedBus;
use crate::config::ChannelConfig;
use crate::domain::event::{kinds, topics};
use crate::domain::message::{extract_mentions, ChatMessage, MemberEntry, ReactionSummary};
use crate::error::CoreError;
use crate::registry::Mailbox;
use crate::service::buffer::MessageBufferHandle;

pub enum ChannelCommand {
    Join {
        user_id: String,
        conn_id: String,
    },
    Leave {
        user_id: String,
        conn_id: String,
    },
    SendMessage {
        user_id: String,
        content: String,
        metadata: serde_json::Value,
    },
    SetTyping {
        user_id: String,
        typing: bool,
    },
    RecentMessages {
        limit: usize,
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    AddReaction {
        user_id: String,
        message_id: String,
        emoji: String,
    },
    RemoveReaction {
        user_id: String,
        message_id: String,
        emoji: String,
    },
    EditMessage {
        user_id: String,
        message_id: String,
        content: String,
    },
    DeleteMessage {
        user_id: String,
        message_id: String,
    },
    /// 输入状态定时器到期（内部） / Typing timer fired (internal)
    TypingExpired { user_id: String },
    Snapshot {
        reply: oneshot::Sender<ChannelSnapshot>,
    },
    Stop,
}

/// 频道状态快照，用于健康检查与测试 / Channel state snapshot for health checks and tests
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub workspace_id: String,
    pub member_count: usize,
    pub typing: Vec<String>,
    pub typing_timer_count: usize,
    pub cached_messages: usize,
}

/// 频道句柄 / Channel handle
#[derive(Clone)]
pub struct ChannelHandle {
    mailbox: Mailbox<ChannelCommand>,
}

impl ChannelHandle {
    pub fn new(mailbox: Mailbox<ChannelCommand>) -> Self {
        Self { mailbox }
    }

    pub fn join(&self, user_id: &str, conn_id: &str) {
        self.mailbox.send(ChannelCommand::Join {
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
        });
    }

    pub fn leave(&self, user_id: &str, conn_id: &str) {
        self.mailbox.send(ChannelCommand::Leave {
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
        });
    }

    pub fn send_message(&self, user_id: &str, content: &str, metadata: serde_json::Value) {
        self.mailbox.send(ChannelCommand::SendMessage {
            user_id: user_id.to_string(),
            content: content.to_string(),
            metadata,
        });
    }

    pub fn set_typing(&self, user_id: &str, typing: bool) {
        self.mailbox.send(ChannelCommand::SetTyping {
            user_id: user_id.to_string(),
            typing,
        });
    }

    pub fn add_reaction(&self, user_id: &str, message_id: &str, emoji: &str) {
        self.mailbox.send(ChannelCommand::AddReaction {
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        });
    }

    pub fn remove_reaction(&self, user_id: &str, message_id: &str, emoji: &str) {
        self.mailbox.send(ChannelCommand::RemoveReaction {
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        });
    }

    pub fn edit_message(&self, user_id: &str, message_id: &str, content: &str) {
        self.mailbox.send(ChannelCommand::EditMessage {
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            content: content.to_string(),
        });
    }

    pub fn delete_message(&self, user_id: &str, message_id: &str) {
        self.mailbox.send(ChannelCommand::DeleteMessage {
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
        });
    }

    pub async fn recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self
            .mailbox
            .send(ChannelCommand::RecentMessages { limit, reply: tx })
        {
            return Err(CoreError::ActorUnavailable {
                name: "channel_actor".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "channel_actor".into(),
        })
    }

    pub async fn snapshot(&self) -> Result<ChannelSnapshot, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(ChannelCommand::Snapshot { reply: tx }) {
            return Err(CoreError::ActorUnavailable {
                name: "channel_actor".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "channel_actor".into(),
        })
    }

    pub fn stop(&self) {
        self.mailbox.send(ChannelCommand::Stop);
    }
}

struct ChannelActor {
    channel_id: String,
    workspace_id: String,
    config: ChannelConfig,
    bus: SharedBus,
    buffer: MessageBufferHandle,
    members: HashMap<String, MemberEntry>,
    /// 输入中的用户：每人恰有一个存活的到期定时器
    /// Users currently typing: exactly one live expiry timer each
    typing: HashMap<String, JoinHandle<()>>,
    recent: VecDeque<ChatMessage>,
    self_tx: mpsc::UnboundedSender<ChannelCommand>,
}

/// 启动频道actor / Spawn a channel actor
pub fn spawn(
    channel_id: &str,
    workspace_id: &str,
    config: ChannelConfig,
    bus: SharedBus,
    buffer: MessageBufferHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) -> (mpsc::UnboundedSender<ChannelCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let self_tx = tx.clone();
    let channel_id = channel_id.to_string();
    let workspace_id = workspace_id.to_string();
    let join = tokio::spawn(async move {
        let mut actor = ChannelActor {
            channel_id,
            workspace_id,
            config,
            bus,
            buffer,
            members: HashMap::new(),
            typing: HashMap::new(),
            recent: VecDeque::new(),
            self_tx,
        };
        info!("🚀 Channel actor started: {}", actor.channel_id);
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::Stop) | None => break,
                        Some(cmd) => actor.handle(cmd),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
        for (_, timer) in actor.typing.drain() {
            timer.abort();
        }
        info!("👋 Channel actor stopped: {}", actor.channel_id);
    });
    (tx, join)
}

impl ChannelActor {
    fn handle(&mut self, cmd: ChannelCommand) {
        match cmd {
            ChannelCommand::Join { user_id, conn_id } => self.join(&user_id, &conn_id),
            ChannelCommand::Leave { user_id, conn_id } => self.leave(&user_id, &conn_id),
            ChannelCommand::SendMessage {
                user_id,
                content,
                metadata,
            } => self.send_message(&user_id, &content, metadata),
            ChannelCommand::SetTyping { user_id, typing } => self.set_typing(&user_id, typing),
            ChannelCommand::TypingExpired { user_id } => {
                if self.typing.remove(&user_id).is_some() {
                    debug!("⌛ Typing expired: {} in {}", user_id, self.channel_id);
                    self.publish_typing();
                }
            }
            ChannelCommand::RecentMessages { limit, reply } => {
                let start = self.recent.len().saturating_sub(limit);
                let messages = self.recent.iter().skip(start).cloned().collect();
                let _ = reply.send(messages);
            }
            ChannelCommand::AddReaction {
                user_id,
                message_id,
                emoji,
            } => self.add_reaction(&user_id, &message_id, &emoji),
            ChannelCommand::RemoveReaction {
                user_id,
                message_id,
                emoji,
            } => self.remove_reaction(&user_id, &message_id, &emoji),
            ChannelCommand::EditMessage {
                user_id,
                message_id,
                content,
            } => self.edit_message(&user_id, &message_id, &content),
            ChannelCommand::DeleteMessage { user_id, message_id } => {
                self.delete_message(&user_id, &message_id)
            }
            ChannelCommand::Snapshot { reply } => {
                let _ = reply.send(ChannelSnapshot {
                    channel_id: self.channel_id.clone(),
                    workspace_id: self.workspace_id.clone(),
                    member_count: self.members.len(),
                    typing: self.typing.keys().cloned().collect(),
                    typing_timer_count: self.typing.values().filter(|t| !t.is_finished()).count(),
                    cached_messages: self.recent.len(),
                });
            }
            ChannelCommand::Stop => unreachable!("handled in the run loop"),
        }
    }

    fn join(&mut self, user_id: &str, conn_id: &str) {
        match self.members.get_mut(user_id) {
            Some(entry) => {
                entry.connections.insert(conn_id.to_string());
                entry.touch();
            }
            None => {
                self.members
                    .insert(user_id.to_string(), MemberEntry::new(user_id, conn_id));
                self.bus.emit(
                    &topics::channel_members(&self.channel_id),
                    kinds::MEMBER_JOINED,
                    serde_json::json!({
                        "channel_id": self.channel_id,
                        "workspace_id": self.workspace_id,
                        "user_id": user_id,
                    }),
                );
            }
        }
    }

    /// 多端离开：连接集未清空则保留成员条目 / Multi-device leave: entry survives while connections remain
    fn leave(&mut self, user_id: &str, conn_id: &str) {
        let Some(entry) = self.members.get_mut(user_id) else {
            return;
        };
        entry.connections.remove(conn_id);
        if !entry.connections.is_empty() {
            entry.touch();
            return;
        }
        self.members.remove(user_id);
        if let Some(timer) = self.typing.remove(user_id) {
            timer.abort();
            self.publish_typing();
        }
        self.bus.emit(
            &topics::channel_members(&self.channel_id),
            kinds::MEMBER_LEFT,
            serde_json::json!({
                "channel_id": self.channel_id,
                "workspace_id": self.workspace_id,
                "user_id": user_id,
            }),
        );
    }

    fn send_message(&mut self, user_id: &str, content: &str, metadata: serde_json::Value) {
        let Some(entry) = self.members.get_mut(user_id) else {
            // 非成员发言：本地拒绝，不崩溃 / Non-member send: rejected locally, no crash
            warn!(
                "🚫 Rejecting message from non-member {} in {}",
                user_id, self.channel_id
            );
            return;
        };
        entry.touch();

        let message = ChatMessage::new(&self.channel_id, user_id, content, metadata);
        self.buffer.enqueue(
            &message.id,
            &self.channel_id,
            user_id,
            content,
            message.metadata.clone(),
        );

        self.recent.push_back(message.clone());
        while self.recent.len() > self.config.recent_cache_size {
            self.recent.pop_front();
        }

        self.bus.emit(
            &topics::channel_messages(&self.channel_id),
            kinds::NEW_MESSAGE,
            serde_json::to_value(&message).unwrap_or_default(),
        );

        // 发消息即结束输入状态 / Sending clears the sender's typing state
        if let Some(timer) = self.typing.remove(user_id) {
            timer.abort();
            self.publish_typing();
        }
    }

    fn set_typing(&mut self, user_id: &str, typing: bool) {
        if typing {
            if !self.members.contains_key(user_id) {
                warn!(
                    "🚫 Ignoring typing from non-member {} in {}",
                    user_id, self.channel_id
                );
                return;
            }
            let newly_typing = !self.typing.contains_key(user_id);
            self.arm_typing_timer(user_id);
            if newly_typing {
                self.publish_typing();
            }
        } else if let Some(timer) = self.typing.remove(user_id) {
            timer.abort();
            self.publish_typing();
        }
    }

    fn add_reaction(&mut self, user_id: &str, message_id: &str, emoji: &str) {
        if !self.members.contains_key(user_id) {
            warn!(
                "🚫 Ignoring reaction from non-member {} in {}",
                user_id, self.channel_id
            );
            return;
        }
        let Some(message) = self.recent.iter_mut().find(|m| m.id == message_id) else {
            debug!("Reaction target {} not in recent cache", message_id);
            return;
        };
        let idx = match message.reactions.iter().position(|r| r.emoji == emoji) {
            Some(idx) => idx,
            None => {
                message.reactions.push(ReactionSummary {
                    emoji: emoji.to_string(),
                    count: 0,
                    user_ids: Vec::new(),
                });
                message.reactions.len() - 1
            }
        };
        let summary = &mut message.reactions[idx];
        if summary.user_ids.iter().any(|u| u == user_id) {
            return;
        }
        summary.user_ids.push(user_id.to_string());
        summary.count = summary.user_ids.len();
        let count = summary.count;
        self.bus.emit(
            &topics::channel_messages(&self.channel_id),
            kinds::REACTION_ADDED,
            serde_json::json!({
                "channel_id": self.channel_id,
                "message_id": message_id,
                "emoji": emoji,
                "user_id": user_id,
                "count": count,
            }),
        );
    }

    fn remove_reaction(&mut self, user_id: &str, message_id: &str, emoji: &str) {
        let Some(message) = self.recent.iter_mut().find(|m| m.id == message_id) else {
            return;
        };
        let Some(idx) = message.reactions.iter().position(|r| r.emoji == emoji) else {
            return;
        };
        let summary = &mut message.reactions[idx];
        let before = summary.user_ids.len();
        summary.user_ids.retain(|u| u != user_id);
        if summary.user_ids.len() == before {
            return;
        }
        summary.count = summary.user_ids.len();
        let count = summary.count;
        if count == 0 {
            message.reactions.remove(idx);
        }
        self.bus.emit(
            &topics::channel_messages(&self.channel_id),
            kinds::REACTION_REMOVED,
            serde_json::json!({
                "channel_id": self.channel_id,
                "message_id": message_id,
                "emoji": emoji,
                "user_id": user_id,
                "count": count,
            }),
        );
    }

    /// 仅作者可编辑；持久副本由存储协作方负责
    /// Author-only; the durable copy is the storage collaborator's concern
    fn edit_message(&mut self, user_id: &str, message_id: &str, content: &str) {
        let channel_id = self.channel_id.clone();
        let Some(message) = self.recent.iter_mut().find(|m| m.id == message_id) else {
            return;
        };
        if message.user_id != user_id {
            warn!(
                "🚫 Rejecting edit of {} by non-author {} in {}",
                message_id, user_id, channel_id
            );
            return;
        }
        message.content = content.to_string();
        message.mentions = extract_mentions(content);
        message.edited_at = Some(chrono::Utc::now().timestamp_millis());
        let payload = serde_json::to_value(&*message).unwrap_or_default();
        self.bus
            .emit(&topics::channel_messages(&channel_id), kinds::MESSAGE_EDITED, payload);
    }

    fn delete_message(&mut self, user_id: &str, message_id: &str) {
        let Some(idx) = self.recent.iter().position(|m| m.id == message_id) else {
            return;
        };
        if self.recent[idx].user_id != user_id {
            warn!(
                "🚫 Rejecting delete of {} by non-author {} in {}",
                message_id, user_id, self.channel_id
            );
            return;
        }
        self.recent.remove(idx);
        self.bus.emit(
            &topics::channel_messages(&self.channel_id),
            kinds::MESSAGE_DELETED,
            serde_json::json!({
                "channel_id": self.channel_id,
                "message_id": message_id,
                "user_id": user_id,
            }),
        );
    }

    fn publish_typing(&self) {
        let typing: Vec<&String> = self.typing.keys().collect();
        self.bus.emit(
            &topics::channel_typing(&self.channel_id),
            kinds::TYPING_CHANGED,
            serde_json::json!({
                "channel_id": self.channel_id,
                "typing": typing,
            }),
        );
    }

    /// 取消并替换该用户的输入定时器 / Cancel-and-replace the user's typing timer
    fn arm_typing_timer(&mut self, user_id: &str) {
        if let Some(old) = self.typing.remove(user_id) {
            old.abort();
        }
        let tx = self.self_tx.clone();
        let user = user_id.to_string();
        let ttl = Duration::from_millis(self.config.typing_ttl_ms);
        let handle = tokio::spawn(async move {
            sleep(ttl).await;
            let _ = tx.send(ChannelCommand::TypingExpired { user_id: user });
        });
        self.typing.insert(user_id.to_string(), handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::BufferConfig;
    use crate::service::buffer;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    struct Ctx {
        channel: ChannelHandle,
        bus: SharedBus,
        store: Arc<MemoryStore>,
        _shutdown: watch::Sender<bool>,
    }

    fn setup(config: ChannelConfig) -> Ctx {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(MemoryStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (buf_tx, _buf_join) = buffer::spawn(
            BufferConfig {
                batch_size: 1,
                flush_interval_ms: 50,
                shutdown_drain_ms: 500,
            },
            store.clone(),
            shutdown_rx.clone(),
        );
        let buffer = MessageBufferHandle::new(Mailbox::new(buf_tx));
        let (tx, _join) = spawn("c1", "w1", config, bus.clone(), buffer, shutdown_rx);
        Ctx {
            channel: ChannelHandle::new(Mailbox::new(tx)),
            bus,
            store,
            _shutdown: shutdown_tx,
        }
    }

    fn default_config() -> ChannelConfig {
        ChannelConfig {
            typing_ttl_ms: 60_000,
            recent_cache_size: 100,
        }
    }

    #[tokio::test]
    async fn test_send_message_broadcast_and_cache() {
        let ctx = setup(default_config());
        let mut messages = ctx.bus.subscribe("test", &topics::channel_messages("c1"));

        ctx.channel.join("alice", "conn-a");
        ctx.channel.join("bob", "conn-b");
        ctx.channel.send_message("alice", "hello", serde_json::json!({}));

        let ev = messages.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::NEW_MESSAGE);
        assert_eq!(ev.payload["content"], "hello");

        let recent = ctx.channel.recent_messages(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "hello");

        // 经缓冲落库 / Persisted through the buffer
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_non_member_send_rejected() {
        let ctx = setup(default_config());
        ctx.channel.send_message("stranger", "hi", serde_json::json!({}));
        let recent = ctx.channel.recent_messages(10).await.unwrap();
        assert!(recent.is_empty());
        assert_eq!(ctx.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_cache_bounded_eviction() {
        let ctx = setup(ChannelConfig {
            typing_ttl_ms: 60_000,
            recent_cache_size: 5,
        });
        ctx.channel.join("alice", "conn-a");
        for i in 0..8 {
            ctx.channel
                .send_message("alice", &format!("msg-{}", i), serde_json::json!({}));
        }
        let recent = ctx.channel.recent_messages(100).await.unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].content, "msg-3");
        assert_eq!(recent[4].content, "msg-7");
    }

    #[tokio::test]
    async fn test_typing_cleared_by_send_before_expiry() {
        let ctx = setup(default_config());
        let mut typing_events = ctx.bus.subscribe("test", &topics::channel_typing("c1"));
        let mut messages = ctx.bus.subscribe("test", &topics::channel_messages("c1"));

        ctx.channel.join("alice", "conn-a");
        ctx.channel.set_typing("alice", true);
        let ev = typing_events.recv().await.unwrap();
        assert_eq!(ev.payload["typing"][0], "alice");

        ctx.channel.send_message("alice", "done typing", serde_json::json!({}));

        // 两个事件都发布且输入集已清空 / Both events published and the typing set is empty
        let ev = messages.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::NEW_MESSAGE);
        let ev = typing_events.recv().await.unwrap();
        assert!(ev.payload["typing"].as_array().unwrap().is_empty());

        let snap = ctx.channel.snapshot().await.unwrap();
        assert!(snap.typing.is_empty());
        assert_eq!(snap.typing_timer_count, 0);
    }

    #[tokio::test]
    async fn test_typing_expiry_republishes() {
        let ctx = setup(ChannelConfig {
            typing_ttl_ms: 80,
            recent_cache_size: 100,
        });
        let mut typing_events = ctx.bus.subscribe("test", &topics::channel_typing("c1"));
        ctx.channel.join("alice", "conn-a");
        ctx.channel.set_typing("alice", true);
        let _ = typing_events.recv().await.unwrap();

        let ev = typing_events.recv().await.unwrap();
        assert!(ev.payload["typing"].as_array().unwrap().is_empty());
        let snap = ctx.channel.snapshot().await.unwrap();
        assert_eq!(snap.typing_timer_count, 0);
    }

    #[tokio::test]
    async fn test_typing_timer_exactly_one_per_user() {
        let ctx = setup(default_config());
        ctx.channel.join("alice", "conn-a");
        // 刷新输入状态不得累积定时器 / Refreshing typing must not accumulate timers
        for _ in 0..5 {
            ctx.channel.set_typing("alice", true);
        }
        let snap = ctx.channel.snapshot().await.unwrap();
        assert_eq!(snap.typing, vec!["alice".to_string()]);
        assert_eq!(snap.typing_timer_count, 1);

        ctx.channel.set_typing("alice", false);
        let snap = ctx.channel.snapshot().await.unwrap();
        assert_eq!(snap.typing_timer_count, 0);
    }

    #[tokio::test]
    async fn test_multi_device_leave_keeps_membership() {
        let ctx = setup(default_config());
        let mut member_events = ctx.bus.subscribe("test", &topics::channel_members("c1"));
        ctx.channel.join("alice", "conn-a");
        let _ = member_events.recv().await.unwrap();

        ctx.channel.join("alice", "conn-b");
        ctx.channel.leave("alice", "conn-a");
        let snap = ctx.channel.snapshot().await.unwrap();
        assert_eq!(snap.member_count, 1);

        ctx.channel.leave("alice", "conn-b");
        let ev = member_events.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::MEMBER_LEFT);
        let snap = ctx.channel.snapshot().await.unwrap();
        assert_eq!(snap.member_count, 0);
    }

    #[tokio::test]
    async fn test_reactions_add_remove() {
        let ctx = setup(default_config());
        let mut messages = ctx.bus.subscribe("test", &topics::channel_messages("c1"));
        ctx.channel.join("alice", "conn-a");
        ctx.channel.join("bob", "conn-b");
        ctx.channel.send_message("alice", "react to me", serde_json::json!({}));
        let ev = messages.recv().await.unwrap();
        let message_id = ev.payload["id"].as_str().unwrap().to_string();

        ctx.channel.add_reaction("bob", &message_id, "👍");
        let ev = messages.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::REACTION_ADDED);
        assert_eq!(ev.payload["count"], 1);

        // 重复回应被忽略 / Duplicate reaction ignored
        ctx.channel.add_reaction("bob", &message_id, "👍");
        ctx.channel.remove_reaction("bob", &message_id, "👍");
        let ev = messages.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::REACTION_REMOVED);
        assert_eq!(ev.payload["count"], 0);
    }

    #[tokio::test]
    async fn test_edit_and_delete_author_only() {
        let ctx = setup(default_config());
        let mut messages = ctx.bus.subscribe("test", &topics::channel_messages("c1"));
        ctx.channel.join("alice", "conn-a");
        ctx.channel.join("mallory", "conn-m");
        ctx.channel.send_message("alice", "original", serde_json::json!({}));
        let ev = messages.recv().await.unwrap();
        let message_id = ev.payload["id"].as_str().unwrap().to_string();

        // 非作者编辑被拒绝 / Non-author edit rejected
        ctx.channel.edit_message("mallory", &message_id, "hacked");
        ctx.channel.edit_message("alice", &message_id, "fixed @bob");
        let ev = messages.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::MESSAGE_EDITED);
        assert_eq!(ev.payload["content"], "fixed @bob");
        assert_eq!(ev.payload["mentions"][0], "bob");

        ctx.channel.delete_message("alice", &message_id);
        let ev = messages.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::MESSAGE_DELETED);
        let recent = ctx.channel.recent_messages(10).await.unwrap();
        assert!(recent.is_empty());
    }
}
