//! 工作区actor / Workspace actor
//!
//! 工作区级成员/连接跟踪与全区广播；成员5分钟不活跃即被超时剔除
//! Workspace-level membership/connection tracking and workspace-wide
//! broadcast; members idle for 5 minutes are timed out

use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::bus::SharedBus;
use crate::config::WorkspaceConfig;
use crate::domain::event::{kinds, topics};
use crate::domain::message::MemberEntry;
use crate::error::CoreError;
use crate::registry::Mailbox;

pub enum WorkspaceCommand {
    Join {
        user_id: String,
        conn_id: String,
    },
    Leave {
        user_id: String,
        conn_id: String,
    },
    /// 全工作区扇出 / Workspace-wide fan-out
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    /// 元数据补丁 / Metadata patch
    Update { patch: serde_json::Value },
    /// 成员活动，重置其超时定时器 / Member activity, resets the member's timeout timer
    Touch { user_id: String },
    /// 成员超时（内部） / Member timeout fired (internal)
    MemberTimeout { user_id: String },
    Members {
        reply: oneshot::Sender<Vec<String>>,
    },
    Snapshot {
        reply: oneshot::Sender<WorkspaceSnapshot>,
    },
    Stop,
}

/// 工作区状态快照 / Workspace state snapshot
#[derive(Debug, Clone)]
pub struct WorkspaceSnapshot {
    pub workspace_id: String,
    pub member_count: usize,
    pub member_timer_count: usize,
    pub metadata: serde_json::Value,
}

/// 工作区句柄 / Workspace handle
#[derive(Clone)]
pub struct WorkspaceHandle {
    mailbox: Mailbox<WorkspaceCommand>,
}

impl WorkspaceHandle {
    pub fn new(mailbox: Mailbox<WorkspaceCommand>) -> Self {
        Self { mailbox }
    }

    pub fn join(&self, user_id: &str, conn_id: &str) {
        self.mailbox.send(WorkspaceCommand::Join {
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
        });
    }

    pub fn leave(&self, user_id: &str, conn_id: &str) {
        self.mailbox.send(WorkspaceCommand::Leave {
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
        });
    }

    pub fn broadcast(&self, event: &str, payload: serde_json::Value) {
        self.mailbox.send(WorkspaceCommand::Broadcast {
            event: event.to_string(),
            payload,
        });
    }

    pub fn update(&self, patch: serde_json::Value) {
        self.mailbox.send(WorkspaceCommand::Update { patch });
    }

    pub fn touch(&self, user_id: &str) {
        self.mailbox.send(WorkspaceCommand::Touch {
            user_id: user_id.to_string(),
        });
    }

    pub async fn members(&self) -> Result<Vec<String>, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(WorkspaceCommand::Members { reply: tx }) {
            return Err(CoreError::ActorUnavailable {
                name: "workspace_actor".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "workspace_actor".into(),
        })
    }

    pub async fn snapshot(&self) -> Result<WorkspaceSnapshot, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(WorkspaceCommand::Snapshot { reply: tx }) {
            return Err(CoreError::ActorUnavailable {
                name: "workspace_actor".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "workspace_actor".into(),
        })
    }

    pub fn stop(&self) {
        self.mailbox.send(WorkspaceCommand::Stop);
    }
}

struct WorkspaceActor {
    workspace_id: String,
    config: WorkspaceConfig,
    bus: SharedBus,
    members: HashMap<String, MemberEntry>,
    /// 每成员一个不活跃定时器 / One inactivity timer per member
    member_timers: HashMap<String, JoinHandle<()>>,
    metadata: serde_json::Value,
    self_tx: mpsc::UnboundedSender<WorkspaceCommand>,
}

/// 启动工作区actor / Spawn a workspace actor
pub fn spawn(
    workspace_id: &str,
    config: WorkspaceConfig,
    bus: SharedBus,
    mut shutdown_rx: watch::Receiver<bool>,
) -> (mpsc::UnboundedSender<WorkspaceCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let self_tx = tx.clone();
    let workspace_id = workspace_id.to_string();
    let join = tokio::spawn(async move {
        let mut actor = WorkspaceActor {
            workspace_id,
            config,
            bus,
            members: HashMap::new(),
            member_timers: HashMap::new(),
            metadata: serde_json::json!({}),
            self_tx,
        };
        info!("🚀 Workspace actor started: {}", actor.workspace_id);
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(WorkspaceCommand::Stop) | None => break,
                        Some(cmd) => actor.handle(cmd),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
        for (_, timer) in actor.member_timers.drain() {
            timer.abort();
        }
        info!("👋 Workspace actor stopped: {}", actor.workspace_id);
    });
    (tx, join)
}

impl WorkspaceActor {
    fn handle(&mut self, cmd: WorkspaceCommand) {
        match cmd {
            WorkspaceCommand::Join { user_id, conn_id } => self.join(&user_id, &conn_id),
            WorkspaceCommand::Leave { user_id, conn_id } => self.leave(&user_id, &conn_id),
            WorkspaceCommand::Broadcast { event, payload } => {
                self.bus
                    .emit(&topics::workspace(&self.workspace_id), &event, payload);
            }
            WorkspaceCommand::Update { patch } => self.update(patch),
            WorkspaceCommand::Touch { user_id } => {
                if let Some(entry) = self.members.get_mut(&user_id) {
                    entry.touch();
                    self.arm_member_timer(&user_id);
                }
            }
            WorkspaceCommand::MemberTimeout { user_id } => {
                self.member_timers.remove(&user_id);
                if self.members.remove(&user_id).is_some() {
                    warn!(
                        "⏰ Member {} timed out of workspace {}",
                        user_id, self.workspace_id
                    );
                    // 与显式离开发布同一事件 / Same event as an explicit leave
                    self.publish_member_left(&user_id);
                }
            }
            WorkspaceCommand::Members { reply } => {
                let _ = reply.send(self.members.keys().cloned().collect());
            }
            WorkspaceCommand::Snapshot { reply } => {
                let _ = reply.send(WorkspaceSnapshot {
                    workspace_id: self.workspace_id.clone(),
                    member_count: self.members.len(),
                    member_timer_count: self
                        .member_timers
                        .values()
                        .filter(|t| !t.is_finished())
                        .count(),
                    metadata: self.metadata.clone(),
                });
            }
            WorkspaceCommand::Stop => unreachable!("handled in the run loop"),
        }
    }

    fn join(&mut self, user_id: &str, conn_id: &str) {
        let is_new = match self.members.get_mut(user_id) {
            Some(entry) => {
                entry.connections.insert(conn_id.to_string());
                entry.touch();
                false
            }
            None => {
                self.members
                    .insert(user_id.to_string(), MemberEntry::new(user_id, conn_id));
                true
            }
        };
        self.arm_member_timer(user_id);
        if is_new {
            self.bus.emit(
                &topics::workspace(&self.workspace_id),
                kinds::MEMBER_JOINED,
                serde_json::json!({
                    "workspace_id": self.workspace_id,
                    "user_id": user_id,
                }),
            );
        }
    }

    fn leave(&mut self, user_id: &str, conn_id: &str) {
        let Some(entry) = self.members.get_mut(user_id) else {
            return;
        };
        entry.connections.remove(conn_id);
        if !entry.connections.is_empty() {
            entry.touch();
            self.arm_member_timer(user_id);
            return;
        }
        self.members.remove(user_id);
        self.cancel_member_timer(user_id);
        self.publish_member_left(user_id);
    }

    /// 补丁合并进元数据对象 / Merge the patch into the metadata object
    fn update(&mut self, patch: serde_json::Value) {
        if let (Some(meta), Some(patch)) = (self.metadata.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                meta.insert(key.clone(), value.clone());
            }
        }
        self.bus.emit(
            &topics::workspace(&self.workspace_id),
            kinds::WORKSPACE_UPDATED,
            serde_json::json!({
                "workspace_id": self.workspace_id,
                "metadata": self.metadata,
            }),
        );
    }

    fn publish_member_left(&self, user_id: &str) {
        self.bus.emit(
            &topics::workspace(&self.workspace_id),
            kinds::MEMBER_LEFT,
            serde_json::json!({
                "workspace_id": self.workspace_id,
                "user_id": user_id,
            }),
        );
    }

    /// 取消并替换成员超时定时器 / Cancel-and-replace the member timeout timer
    fn arm_member_timer(&mut self, user_id: &str) {
        self.cancel_member_timer(user_id);
        let tx = self.self_tx.clone();
        let user = user_id.to_string();
        let timeout = Duration::from_millis(self.config.member_timeout_ms);
        let handle = tokio::spawn(async move {
            sleep(timeout).await;
            let _ = tx.send(WorkspaceCommand::MemberTimeout { user_id: user });
        });
        self.member_timers.insert(user_id.to_string(), handle);
    }

    fn cancel_member_timer(&mut self, user_id: &str) {
        if let Some(handle) = self.member_timers.remove(user_id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use std::sync::Arc;

    fn setup(config: WorkspaceConfig) -> (WorkspaceHandle, SharedBus, watch::Sender<bool>) {
        let bus = Arc::new(EventBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, _join) = spawn("w1", config, bus.clone(), shutdown_rx);
        (WorkspaceHandle::new(Mailbox::new(tx)), bus, shutdown_tx)
    }

    #[tokio::test]
    async fn test_join_broadcast_update() {
        let (workspace, bus, _shutdown) = setup(WorkspaceConfig {
            member_timeout_ms: 60_000,
        });
        let mut events = bus.subscribe("test", &topics::workspace("w1"));

        workspace.join("alice", "conn-a");
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::MEMBER_JOINED);

        workspace.broadcast("announcement", serde_json::json!({"text": "hi all"}));
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, "announcement");
        assert_eq!(ev.payload["text"], "hi all");

        workspace.update(serde_json::json!({"name": "Engineering"}));
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::WORKSPACE_UPDATED);
        assert_eq!(ev.payload["metadata"]["name"], "Engineering");
    }

    #[tokio::test]
    async fn test_member_timeout_force_leaves() {
        let (workspace, bus, _shutdown) = setup(WorkspaceConfig {
            member_timeout_ms: 80,
        });
        let mut events = bus.subscribe("test", &topics::workspace("w1"));
        workspace.join("alice", "conn-a");
        let _ = events.recv().await.unwrap();

        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::MEMBER_LEFT);
        let snap = workspace.snapshot().await.unwrap();
        assert_eq!(snap.member_count, 0);
        assert_eq!(snap.member_timer_count, 0);
    }

    #[tokio::test]
    async fn test_touch_resets_member_timer() {
        let (workspace, _bus, _shutdown) = setup(WorkspaceConfig {
            member_timeout_ms: 150,
        });
        workspace.join("alice", "conn-a");
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(90)).await;
            workspace.touch("alice");
        }
        let snap = workspace.snapshot().await.unwrap();
        assert_eq!(snap.member_count, 1);
        assert_eq!(snap.member_timer_count, 1);
    }

    #[tokio::test]
    async fn test_multi_device_membership_independent_lifecycle() {
        let (workspace, bus, _shutdown) = setup(WorkspaceConfig {
            member_timeout_ms: 60_000,
        });
        let mut events = bus.subscribe("test", &topics::workspace("w1"));
        workspace.join("alice", "conn-a");
        workspace.join("alice", "conn-b");
        let _ = events.recv().await.unwrap();

        workspace.leave("alice", "conn-a");
        let snap = workspace.snapshot().await.unwrap();
        assert_eq!(snap.member_count, 1);

        workspace.leave("alice", "conn-b");
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, kinds::MEMBER_LEFT);
        let snap = workspace.snapshot().await.unwrap();
        assert_eq!(snap.member_count, 0);
    }
}
