//! 监督者 / Supervisor
//!
//! 静态进程树：按依赖顺序启动注册表与各单例，再挂两个动态池
//! （工作区actor、频道actor）。每个静态子项独立重启，60秒窗口内
//! 最多5次，超出即判定不健康并停止重启。
//! Static process tree: registries and singletons in dependency order, then
//! two dynamic pools (workspace actors, channel actors). Each static child
//! restarts independently, capped at 5 restarts per 60 s window, after which
//! the child is unhealthy and no longer restarted.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::actors::channel::{ChannelCommand, ChannelHandle};
use crate::actors::workspace::{WorkspaceCommand, WorkspaceHandle};
use crate::bus::{EventBus, SharedBus};
use crate::config::{CoreConfig, SupervisorConfig};
use crate::coordinator::Coordinator;
use crate::error::{CoreError, CoreResult};
use crate::identity::{IdentityProvider, StaticIdentity};
use crate::notify::{self, delivery, NotificationDispatcherHandle};
use crate::registry::{Mailbox, Registry};
use crate::service::{buffer, presence};
use crate::service::buffer::MessageBufferHandle;
use crate::service::presence::PresenceHandle;
use crate::storage::{MemoryStore, MessageStore, NotificationStore, UploadStore};
use crate::upload::pipeline::{
    MediaTransformer, NoopScanner, PassthroughTransformer, PathThumbnailer, ThumbnailMaker,
    VirusScanner,
};
use crate::upload::{self, UploadSchedulerHandle};

/// 外部协作方集合 / External collaborator set
pub struct Collaborators {
    pub message_store: Arc<dyn MessageStore>,
    pub upload_store: Arc<dyn UploadStore>,
    pub notification_store: Arc<dyn NotificationStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub scanner: Arc<dyn VirusScanner>,
    pub transformer: Arc<dyn MediaTransformer>,
    pub thumbnailer: Arc<dyn ThumbnailMaker>,
}

impl Collaborators {
    /// 全内存接线，用于默认启动与测试 / All-in-memory wiring for default startup and tests
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            message_store: store.clone(),
            upload_store: store.clone(),
            notification_store: store,
            identity: Arc::new(StaticIdentity::new()),
            scanner: Arc::new(NoopScanner),
            transformer: Arc::new(PassthroughTransformer),
            thumbnailer: Arc::new(PathThumbnailer),
        }
    }
}

/// 静态子项状态 / Static child state
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub up: bool,
    pub restarts: u32,
}

/// 健康报告 / Health report
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub services: HashMap<String, ServiceState>,
    pub workspace_actors: usize,
    pub channel_actors: usize,
}

pub struct CoreSupervisor {
    config: CoreConfig,
    bus: SharedBus,
    coordinator: Arc<Coordinator>,
    presence: PresenceHandle,
    buffer: MessageBufferHandle,
    notify: NotificationDispatcherHandle,
    uploads: UploadSchedulerHandle,
    workspaces: Arc<Registry<WorkspaceCommand>>,
    channels: Arc<Registry<ChannelCommand>>,
    services: Arc<DashMap<String, ServiceState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CoreSupervisor {
    /// 按依赖顺序启动整棵树 / Start the whole tree in dependency order
    pub fn start(config: CoreConfig, collaborators: Collaborators) -> CoreResult<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let services: Arc<DashMap<String, ServiceState>> = Arc::new(DashMap::new());

        // 1. 注册表与总线，被动叶子 / Registries and the bus, passive leaves
        let bus: SharedBus = Arc::new(EventBus::new());
        let workspaces: Arc<Registry<WorkspaceCommand>> = Arc::new(Registry::new());
        let channels: Arc<Registry<ChannelCommand>> = Arc::new(Registry::new());
        for name in ["workspace_registry", "channel_registry", "event_bus"] {
            services.insert(
                name.to_string(),
                ServiceState {
                    up: true,
                    restarts: 0,
                },
            );
        }

        // 2. 消息缓冲 / Message buffer
        let buffer_mailbox: Mailbox<buffer::BufferCommand> = {
            let cfg = config.buffer.clone();
            let store = collaborators.message_store.clone();
            let shutdown = shutdown_rx.clone();
            let (tx, join) = buffer::spawn(cfg.clone(), store.clone(), shutdown.clone());
            let mailbox = Mailbox::new(tx);
            let factory_mailbox = mailbox.clone();
            supervise(
                "message_buffer",
                move || {
                    let (tx, join) = buffer::spawn(cfg.clone(), store.clone(), shutdown.clone());
                    factory_mailbox.replace(tx);
                    join
                },
                join,
                services.clone(),
                config.supervisor.clone(),
                shutdown_rx.clone(),
            );
            mailbox
        };
        let buffer_handle = MessageBufferHandle::new(buffer_mailbox);

        // 3. 在线状态跟踪 / Presence tracker
        let presence_mailbox: Mailbox<presence::PresenceCommand> = {
            let cfg = config.presence.clone();
            let bus = bus.clone();
            let shutdown = shutdown_rx.clone();
            let (tx, join) = presence::spawn(cfg.clone(), bus.clone(), shutdown.clone());
            let mailbox = Mailbox::new(tx);
            let factory_mailbox = mailbox.clone();
            supervise(
                "presence_tracker",
                move || {
                    let (tx, join) = presence::spawn(cfg.clone(), bus.clone(), shutdown.clone());
                    factory_mailbox.replace(tx);
                    join
                },
                join,
                services.clone(),
                config.supervisor.clone(),
                shutdown_rx.clone(),
            );
            mailbox
        };
        let presence_handle = PresenceHandle::new(presence_mailbox);

        // 4. 通知分发 / Notification dispatcher
        let strategies = delivery::default_strategies(
            bus.clone(),
            collaborators.identity.clone(),
            config.notify.webhook_timeout_ms,
            config.notify.webhook_secret.clone(),
        )
        .map_err(CoreError::Internal)?;
        let notify_mailbox: Mailbox<notify::NotifyCommand> = {
            let cfg = config.notify.clone();
            let store = collaborators.notification_store.clone();
            let shutdown = shutdown_rx.clone();
            let (tx, join) = notify::spawn(
                cfg.clone(),
                strategies.clone(),
                store.clone(),
                shutdown.clone(),
            );
            let mailbox = Mailbox::new(tx);
            let factory_mailbox = mailbox.clone();
            supervise(
                "notification_dispatcher",
                move || {
                    let (tx, join) = notify::spawn(
                        cfg.clone(),
                        strategies.clone(),
                        store.clone(),
                        shutdown.clone(),
                    );
                    factory_mailbox.replace(tx);
                    join
                },
                join,
                services.clone(),
                config.supervisor.clone(),
                shutdown_rx.clone(),
            );
            mailbox
        };
        let notify_handle = NotificationDispatcherHandle::new(notify_mailbox);

        // 5. 上传任务调度 / Upload job scheduler
        let uploads_mailbox: Mailbox<upload::UploadCommand> = {
            let cfg = config.upload.clone();
            let bus = bus.clone();
            let scanner = collaborators.scanner.clone();
            let transformer = collaborators.transformer.clone();
            let thumbnailer = collaborators.thumbnailer.clone();
            let store = collaborators.upload_store.clone();
            let shutdown = shutdown_rx.clone();
            let (tx, join) = upload::spawn(
                cfg.clone(),
                bus.clone(),
                scanner.clone(),
                transformer.clone(),
                thumbnailer.clone(),
                store.clone(),
                shutdown.clone(),
            );
            let mailbox = Mailbox::new(tx);
            let factory_mailbox = mailbox.clone();
            supervise(
                "upload_scheduler",
                move || {
                    let (tx, join) = upload::spawn(
                        cfg.clone(),
                        bus.clone(),
                        scanner.clone(),
                        transformer.clone(),
                        thumbnailer.clone(),
                        store.clone(),
                        shutdown.clone(),
                    );
                    factory_mailbox.replace(tx);
                    join
                },
                join,
                services.clone(),
                config.supervisor.clone(),
                shutdown_rx.clone(),
            );
            mailbox
        };
        let uploads_handle = UploadSchedulerHandle::new(uploads_mailbox);

        // 6. 协调器与两个动态池 / Coordinator and the two dynamic pools
        let coordinator = Arc::new(Coordinator::new(
            config.clone(),
            bus.clone(),
            workspaces.clone(),
            channels.clone(),
            buffer_handle.clone(),
            notify_handle.clone(),
            shutdown_rx.clone(),
        ));
        let event_loop = coordinator.spawn_event_loop();
        {
            let coordinator = coordinator.clone();
            supervise(
                "coordinator",
                move || coordinator.spawn_event_loop(),
                event_loop,
                services.clone(),
                config.supervisor.clone(),
                shutdown_rx,
            );
        }

        info!("✅ Supervision tree started");
        Ok(Self {
            config,
            bus,
            coordinator,
            presence: presence_handle,
            buffer: buffer_handle,
            notify: notify_handle,
            uploads: uploads_handle,
            workspaces,
            channels,
            services,
            shutdown_tx,
        })
    }

    pub fn bus(&self) -> SharedBus {
        self.bus.clone()
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn presence(&self) -> PresenceHandle {
        self.presence.clone()
    }

    pub fn buffer(&self) -> MessageBufferHandle {
        self.buffer.clone()
    }

    pub fn notifications(&self) -> NotificationDispatcherHandle {
        self.notify.clone()
    }

    pub fn uploads(&self) -> UploadSchedulerHandle {
        self.uploads.clone()
    }

    // 动态池接口 / Dynamic pool API

    pub fn start_workspace_actor(&self, workspace_id: &str) -> WorkspaceHandle {
        self.coordinator.ensure_workspace(workspace_id)
    }

    pub fn stop_workspace_actor(&self, workspace_id: &str) {
        self.coordinator.shutdown_workspace(workspace_id);
    }

    pub fn start_channel_actor(&self, workspace_id: &str, channel_id: &str) -> ChannelHandle {
        self.coordinator.ensure_channel(workspace_id, channel_id)
    }

    pub fn stop_channel_actor(&self, channel_id: &str) {
        self.coordinator.shutdown_channel(channel_id);
    }

    pub fn list_workspace_actors(&self) -> Vec<String> {
        self.workspaces.list()
    }

    pub fn list_channel_actors(&self) -> Vec<String> {
        self.channels.list()
    }

    /// 每服务up/down加动态池计数 / Per-service up/down plus dynamic pool counts
    pub fn health_check(&self) -> HealthReport {
        let services: HashMap<String, ServiceState> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let healthy = services.values().all(|s| s.up);
        HealthReport {
            healthy,
            services,
            workspace_actors: self.workspaces.len(),
            channel_actors: self.channels.len(),
        }
    }

    /// 优雅关停：先尽力排空缓冲，再广播关停信号
    /// Graceful shutdown: best-effort buffer drain first, then the shutdown signal
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down supervision tree");
        let drain = Duration::from_millis(self.config.buffer.shutdown_drain_ms);
        match tokio::time::timeout(drain, self.buffer.flush()).await {
            Ok(Ok(outcome)) => {
                if outcome.flushed > 0 {
                    info!("💾 Final flush wrote {} messages", outcome.flushed);
                }
            }
            Ok(Err(e)) => warn!("⚠️  Final flush failed: {}", e),
            Err(_) => warn!("⚠️  Final flush exceeded drain deadline"),
        }
        let _ = self.shutdown_tx.send(true);
    }
}

/// 监督一个静态子项 / Supervise one static child
///
/// 子任务结束即按预算重启；窗口内超出上限则标记down并放弃
/// Restarts the child task within budget; past the cap inside the window the
/// child is marked down and abandoned
fn supervise<F>(
    name: &'static str,
    factory: F,
    initial: JoinHandle<()>,
    services: Arc<DashMap<String, ServiceState>>,
    policy: SupervisorConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    F: Fn() -> JoinHandle<()> + Send + 'static,
{
    services.insert(
        name.to_string(),
        ServiceState {
            up: true,
            restarts: 0,
        },
    );
    tokio::spawn(async move {
        let window = Duration::from_millis(policy.restart_window_ms);
        let mut restart_times: Vec<Instant> = Vec::new();
        let mut join = initial;
        loop {
            tokio::select! {
                result = &mut join => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if let Err(e) = &result {
                        if e.is_panic() {
                            warn!("💥 Service {} panicked", name);
                        }
                    }
                    let now = Instant::now();
                    restart_times.retain(|t| now.duration_since(*t) <= window);
                    if restart_times.len() >= policy.max_restarts {
                        error!(
                            "❌ Service {} exceeded {} restarts in {:?}, marking unhealthy",
                            name, policy.max_restarts, window
                        );
                        if let Some(mut state) = services.get_mut(name) {
                            state.up = false;
                        }
                        break;
                    }
                    restart_times.push(now);
                    if let Some(mut state) = services.get_mut(name) {
                        state.restarts += 1;
                    }
                    warn!("🔄 Restarting service {}", name);
                    join = factory();
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_restart_budget_exhaustion_marks_unhealthy() {
        let services: Arc<DashMap<String, ServiceState>> = Arc::new(DashMap::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let starts = Arc::new(AtomicU32::new(0));
        let starts_in_factory = starts.clone();
        let crash = move || {
            starts_in_factory.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async { panic!("boom") })
        };
        let initial = crash();
        supervise(
            "crashy",
            crash,
            initial,
            services.clone(),
            SupervisorConfig {
                max_restarts: 3,
                restart_window_ms: 60_000,
            },
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = services.get("crashy").unwrap().clone();
        assert!(!state.up);
        assert_eq!(state.restarts, 3);
        // 初始启动 + 3次重启后放弃 / Initial start + 3 restarts, then abandoned
        assert_eq!(starts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_clean_exit_on_shutdown_keeps_service_up() {
        let services: Arc<DashMap<String, ServiceState>> = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let child_shutdown = shutdown_rx.clone();
        let factory = move || {
            let mut rx = child_shutdown.clone();
            tokio::spawn(async move {
                let _ = rx.changed().await;
            })
        };
        let initial = factory();
        supervise(
            "quiet",
            factory,
            initial,
            services.clone(),
            SupervisorConfig::default(),
            shutdown_rx,
        );

        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = services.get("quiet").unwrap().clone();
        assert!(state.up);
        assert_eq!(state.restarts, 0);
    }

    #[tokio::test]
    async fn test_supervisor_tree_starts_and_reports_health() {
        let supervisor =
            CoreSupervisor::start(CoreConfig::default(), Collaborators::in_memory()).unwrap();
        let report = supervisor.health_check();
        assert!(report.healthy);
        for name in [
            "workspace_registry",
            "channel_registry",
            "event_bus",
            "message_buffer",
            "presence_tracker",
            "notification_dispatcher",
            "upload_scheduler",
            "coordinator",
        ] {
            assert!(report.services.contains_key(name), "missing {}", name);
            assert!(report.services[name].up, "{} down", name);
        }
        assert_eq!(report.workspace_actors, 0);

        supervisor.start_workspace_actor("w1");
        supervisor.start_channel_actor("w1", "c1");
        let report = supervisor.health_check();
        assert_eq!(report.workspace_actors, 1);
        assert_eq!(report.channel_actors, 1);

        supervisor.stop_workspace_actor("w1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = supervisor.health_check();
        assert_eq!(report.workspace_actors, 0);
        assert_eq!(report.channel_actors, 0);

        supervisor.shutdown().await;
    }
}
