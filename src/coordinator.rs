//! 协调器 / Coordinator
//!
//! 按需懒启动工作区/频道actor（幂等），订阅总线并转发横切事件，
//! 级联关停，并监视actor意外终止以清理登记
//! Lazily starts workspace/channel actors on demand (idempotent), subscribes
//! to the bus and re-dispatches cross-cutting events, cascades shutdown, and
//! monitors actors to clean bookkeeping on unexpected termination

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actors::{channel, workspace};
use crate::actors::channel::{ChannelCommand, ChannelHandle};
use crate::actors::workspace::{WorkspaceCommand, WorkspaceHandle};
use crate::bus::SharedBus;
use crate::config::CoreConfig;
use crate::domain::event::{kinds, topics};
use crate::domain::message::{NotificationKind, NotifyOptions};
use crate::notify::NotificationDispatcherHandle;
use crate::registry::{keys, ActorHandle, Mailbox, Registry};
use crate::service::buffer::MessageBufferHandle;

pub struct Coordinator {
    config: CoreConfig,
    bus: SharedBus,
    workspaces: Arc<Registry<WorkspaceCommand>>,
    channels: Arc<Registry<ChannelCommand>>,
    /// 频道到其所属工作区 / Channel to its owning workspace
    channel_workspaces: DashMap<String, String>,
    buffer: MessageBufferHandle,
    notify: NotificationDispatcherHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(
        config: CoreConfig,
        bus: SharedBus,
        workspaces: Arc<Registry<WorkspaceCommand>>,
        channels: Arc<Registry<ChannelCommand>>,
        buffer: MessageBufferHandle,
        notify: NotificationDispatcherHandle,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            bus,
            workspaces,
            channels,
            channel_workspaces: DashMap::new(),
            buffer,
            notify,
            shutdown_rx,
        }
    }

    /// 幂等启动工作区actor / Idempotently start a workspace actor
    pub fn ensure_workspace(&self, workspace_id: &str) -> WorkspaceHandle {
        let key = keys::workspace(workspace_id);
        let mut spawned: Option<JoinHandle<()>> = None;
        let handle = self.workspaces.get_or_insert_with(&key, || {
            let (tx, join) = workspace::spawn(
                workspace_id,
                self.config.workspace.clone(),
                self.bus.clone(),
                self.shutdown_rx.clone(),
            );
            let handle = ActorHandle::new(Mailbox::new(tx), join.abort_handle());
            spawned = Some(join);
            handle
        });
        if let Some(join) = spawned {
            Self::monitor(self.workspaces.clone(), key, handle.started_at, join);
        }
        WorkspaceHandle::new(handle.mailbox)
    }

    /// 幂等启动频道actor，首次引用时一并确保其工作区
    /// Idempotently start a channel actor, ensuring its workspace on first reference
    pub fn ensure_channel(&self, workspace_id: &str, channel_id: &str) -> ChannelHandle {
        self.ensure_workspace(workspace_id);
        let key = keys::channel(channel_id);
        let mut spawned: Option<JoinHandle<()>> = None;
        let handle = self.channels.get_or_insert_with(&key, || {
            let (tx, join) = channel::spawn(
                channel_id,
                workspace_id,
                self.config.channel.clone(),
                self.bus.clone(),
                self.buffer.clone(),
                self.shutdown_rx.clone(),
            );
            let handle = ActorHandle::new(Mailbox::new(tx), join.abort_handle());
            spawned = Some(join);
            handle
        });
        if let Some(join) = spawned {
            self.channel_workspaces
                .insert(channel_id.to_string(), workspace_id.to_string());
            Self::monitor(self.channels.clone(), key, handle.started_at, join);
        }
        ChannelHandle::new(handle.mailbox)
    }

    /// 级联关停：先该工作区的全部频道，再工作区自身
    /// Cascade: every channel of the workspace first, then the workspace itself
    pub fn shutdown_workspace(&self, workspace_id: &str) {
        let channel_ids: Vec<String> = self
            .channel_workspaces
            .iter()
            .filter(|e| e.value() == workspace_id)
            .map(|e| e.key().clone())
            .collect();
        for channel_id in channel_ids {
            self.shutdown_channel(&channel_id);
        }
        if let Some(handle) = self.workspaces.unregister(&keys::workspace(workspace_id)) {
            handle.mailbox.send(WorkspaceCommand::Stop);
            info!("🛑 Workspace {} shut down", workspace_id);
        }
    }

    pub fn shutdown_channel(&self, channel_id: &str) {
        self.channel_workspaces.remove(channel_id);
        if let Some(handle) = self.channels.unregister(&keys::channel(channel_id)) {
            handle.mailbox.send(ChannelCommand::Stop);
            info!("🛑 Channel {} shut down", channel_id);
        }
    }

    pub fn workspace_count(&self) -> usize {
        self.workspaces.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn list_workspaces(&self) -> Vec<String> {
        self.workspaces.list()
    }

    pub fn list_channels(&self) -> Vec<String> {
        self.channels.list()
    }

    /// 监视actor终止并清理登记 / Monitor actor termination and clean bookkeeping
    fn monitor<C: Send + 'static>(
        registry: Arc<Registry<C>>,
        key: String,
        started_at: i64,
        join: JoinHandle<()>,
    ) {
        tokio::spawn(async move {
            let result = join.await;
            let removed = registry.unregister_if_started_at(&key, started_at);
            match result {
                Err(e) if e.is_panic() => {
                    warn!("💥 Actor {} terminated unexpectedly, bookkeeping cleared", key);
                }
                _ if removed => debug!("Actor {} finished, bookkeeping cleared", key),
                _ => {}
            }
        });
    }

    /// 订阅总线并转发横切事件 / Subscribe to the bus and re-dispatch cross-cutting events
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = self.clone();
        let mut channel_events = self.bus.subscribe("coordinator", "channel:*");
        let mut upload_events = self.bus.subscribe("coordinator", topics::UPLOADS);
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = channel_events.recv() => coordinator.on_channel_event(event),
                    Some(event) = upload_events.recv() => coordinator.on_upload_event(event),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() { break; }
                    }
                    else => break,
                }
            }
        })
    }

    fn on_channel_event(&self, event: crate::domain::event::BusEvent) {
        match event.kind.as_str() {
            // 新成员加入：确保其工作区已运行并记录活动
            // A new member joining ensures its workspace is running and counts as activity
            kinds::MEMBER_JOINED => {
                let (Some(workspace_id), Some(user_id)) = (
                    event.payload["workspace_id"].as_str(),
                    event.payload["user_id"].as_str(),
                ) else {
                    return;
                };
                let workspace = self.ensure_workspace(workspace_id);
                workspace.touch(user_id);
            }
            // 带提及的新消息触发通知入队 / A new message with mentions triggers notification enqueue
            kinds::NEW_MESSAGE => {
                let Some(channel_id) = event.payload["channel_id"].as_str() else {
                    return;
                };
                if let Some(sender) = event.payload["user_id"].as_str() {
                    if let Some(workspace_id) = self
                        .channel_workspaces
                        .get(channel_id)
                        .map(|w| w.value().clone())
                    {
                        self.ensure_workspace(&workspace_id).touch(sender);
                    }
                }
                let Some(mentions) = event.payload["mentions"].as_array() else {
                    return;
                };
                for mention in mentions.iter().filter_map(|m| m.as_str()) {
                    self.notify.enqueue(
                        NotificationKind::InApp,
                        mention,
                        serde_json::json!({
                            "type": "mention",
                            "channel_id": channel_id,
                            "message_id": event.payload["id"],
                            "from": event.payload["user_id"],
                            "content": event.payload["content"],
                        }),
                        NotifyOptions::default(),
                    );
                }
            }
            _ => {}
        }
    }

    fn on_upload_event(&self, event: crate::domain::event::BusEvent) {
        let kind = event.kind.as_str();
        if kind != kinds::UPLOAD_COMPLETED && kind != kinds::UPLOAD_FAILED {
            return;
        }
        let Some(submitter) = event.payload["submitter_id"].as_str() else {
            return;
        };
        self.notify.enqueue(
            NotificationKind::InApp,
            submitter,
            serde_json::json!({
                "type": kind,
                "upload_id": event.payload["upload_id"],
                "error": event.payload["error"],
            }),
            NotifyOptions::default(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::BufferConfig;
    use crate::service::buffer;
    use crate::storage::MemoryStore;
    use tokio::time::Duration;

    fn setup() -> (Arc<Coordinator>, SharedBus, watch::Sender<bool>) {
        let config = CoreConfig::default();
        let bus = Arc::new(EventBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = Arc::new(MemoryStore::new());
        let (buf_tx, _join) = buffer::spawn(
            BufferConfig::default(),
            store,
            shutdown_rx.clone(),
        );
        let strategies = std::collections::HashMap::new();
        let (notify_tx, _notify_join) = crate::notify::spawn(
            config.notify.clone(),
            strategies,
            Arc::new(MemoryStore::new()),
            shutdown_rx.clone(),
        );
        let coordinator = Arc::new(Coordinator::new(
            config,
            bus.clone(),
            Arc::new(Registry::new()),
            Arc::new(Registry::new()),
            MessageBufferHandle::new(Mailbox::new(buf_tx)),
            NotificationDispatcherHandle::new(Mailbox::new(notify_tx)),
            shutdown_rx,
        ));
        (coordinator, bus, shutdown_tx)
    }

    #[tokio::test]
    async fn test_ensure_workspace_is_idempotent() {
        let (coordinator, _bus, _shutdown) = setup();
        let first = coordinator.ensure_workspace("w1");
        let second = coordinator.ensure_workspace("w1");
        assert_eq!(coordinator.workspace_count(), 1);

        // 两个句柄指向同一actor / Both handles address the same actor
        first.join("alice", "conn-a");
        let members = second.members().await.unwrap();
        assert_eq!(members, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_channel_ensures_workspace() {
        let (coordinator, _bus, _shutdown) = setup();
        coordinator.ensure_channel("w1", "c1");
        assert_eq!(coordinator.workspace_count(), 1);
        assert_eq!(coordinator.channel_count(), 1);
        assert!(coordinator.list_workspaces().contains(&"workspace:w1".to_string()));
        assert!(coordinator.list_channels().contains(&"channel:c1".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_workspace_cascades_to_channels() {
        let (coordinator, _bus, _shutdown) = setup();
        coordinator.ensure_channel("w1", "c1");
        coordinator.ensure_channel("w1", "c2");
        coordinator.ensure_channel("w2", "c3");

        coordinator.shutdown_workspace("w1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.workspace_count(), 1);
        assert_eq!(coordinator.channel_count(), 1);
        assert!(coordinator.list_channels().contains(&"channel:c3".to_string()));
    }

    #[tokio::test]
    async fn test_monitor_clears_bookkeeping_on_stop() {
        let (coordinator, _bus, _shutdown) = setup();
        let channel = coordinator.ensure_channel("w1", "c1");
        channel.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // 意外/显式终止都会清理登记 / Bookkeeping cleared on termination either way
        assert_eq!(coordinator.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_member_joined_event_ensures_workspace() {
        let (coordinator, bus, _shutdown) = setup();
        let _loop = coordinator.spawn_event_loop();

        bus.emit(
            &topics::channel_members("c9"),
            kinds::MEMBER_JOINED,
            serde_json::json!({
                "channel_id": "c9",
                "workspace_id": "w9",
                "user_id": "alice",
            }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.workspace_count(), 1);
        assert!(coordinator.list_workspaces().contains(&"workspace:w9".to_string()));
    }
}
