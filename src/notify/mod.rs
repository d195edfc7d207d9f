//! 通知分发 / Notification dispatch
//!
//! 优先级队列+重试引擎：批量拉取、按类型并发投递、指数退避、失败停驻与定期清理
//! Priority queue + retry engine: batched pulls, concurrent per-kind
//! delivery, exponential backoff, failed-list parking and periodic purge

pub mod delivery;

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::config::NotifyConfig;
use crate::domain::message::{Notification, NotificationKind, NotificationPriority, NotifyOptions};
use crate::error::CoreError;
use crate::registry::Mailbox;
use crate::storage::NotificationStore;
use delivery::DeliveryStrategy;

/// 分发统计 / Dispatch stats
#[derive(Debug, Clone)]
pub struct NotifyStats {
    pub queued: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub sent: u64,
}

pub enum NotifyCommand {
    Enqueue {
        kind: NotificationKind,
        recipient_id: String,
        payload: serde_json::Value,
        opts: NotifyOptions,
    },
    EnqueueBatch {
        items: Vec<(NotificationKind, String, serde_json::Value, NotifyOptions)>,
    },
    /// 立即拉取一批 / Pull a batch immediately
    ProcessNow,
    /// 重新排队失败列表 / Requeue the failed list
    RetryFailed,
    /// 投递成功（内部） / Delivery succeeded (internal)
    Delivered { id: String },
    /// 投递失败（内部） / Delivery failed (internal)
    DeliveryFailed {
        notification: Box<Notification>,
        error: String,
    },
    Stats {
        reply: oneshot::Sender<NotifyStats>,
    },
}

/// 分发器句柄 / Dispatcher handle
#[derive(Clone)]
pub struct NotificationDispatcherHandle {
    mailbox: Mailbox<NotifyCommand>,
}

impl NotificationDispatcherHandle {
    pub fn new(mailbox: Mailbox<NotifyCommand>) -> Self {
        Self { mailbox }
    }

    pub fn enqueue(
        &self,
        kind: NotificationKind,
        recipient_id: &str,
        payload: serde_json::Value,
        opts: NotifyOptions,
    ) {
        self.mailbox.send(NotifyCommand::Enqueue {
            kind,
            recipient_id: recipient_id.to_string(),
            payload,
            opts,
        });
    }

    pub fn enqueue_batch(
        &self,
        items: Vec<(NotificationKind, String, serde_json::Value, NotifyOptions)>,
    ) {
        self.mailbox.send(NotifyCommand::EnqueueBatch { items });
    }

    pub fn process_now(&self) {
        self.mailbox.send(NotifyCommand::ProcessNow);
    }

    pub fn retry_failed(&self) {
        self.mailbox.send(NotifyCommand::RetryFailed);
    }

    pub async fn stats(&self) -> Result<NotifyStats, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(NotifyCommand::Stats { reply: tx }) {
            return Err(CoreError::ActorUnavailable {
                name: "notification_dispatcher".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "notification_dispatcher".into(),
        })
    }
}

struct NotificationDispatcher {
    config: NotifyConfig,
    strategies: HashMap<NotificationKind, Arc<dyn DeliveryStrategy>>,
    store: Arc<dyn NotificationStore>,
    /// 高优先级在队首 / High priority at the front
    queue: VecDeque<Notification>,
    /// 有界失败列表 / Bounded failed list
    failed: VecDeque<Notification>,
    in_flight: usize,
    sent: u64,
    self_tx: mpsc::UnboundedSender<NotifyCommand>,
}

/// 启动通知分发actor / Spawn the notification dispatcher actor
pub fn spawn(
    config: NotifyConfig,
    strategies: HashMap<NotificationKind, Arc<dyn DeliveryStrategy>>,
    store: Arc<dyn NotificationStore>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> (mpsc::UnboundedSender<NotifyCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let self_tx = tx.clone();
    let join = tokio::spawn(async move {
        let batch_every = Duration::from_millis(config.batch_interval_ms);
        let sweep_every = Duration::from_millis(config.sweep_interval_ms);
        let mut actor = NotificationDispatcher {
            config,
            strategies,
            store,
            queue: VecDeque::new(),
            failed: VecDeque::new(),
            in_flight: 0,
            sent: 0,
            self_tx,
        };
        let mut batch_tick = interval(batch_every);
        let mut sweep_tick = interval(sweep_every);
        batch_tick.tick().await;
        sweep_tick.tick().await;
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => actor.handle(cmd),
                        None => break,
                    }
                }
                _ = batch_tick.tick() => actor.process_batch(),
                _ = sweep_tick.tick() => actor.sweep_failed(),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
    });
    (tx, join)
}

impl NotificationDispatcher {
    fn handle(&mut self, cmd: NotifyCommand) {
        match cmd {
            NotifyCommand::Enqueue {
                kind,
                recipient_id,
                payload,
                opts,
            } => {
                self.enqueue(Notification::new(kind, &recipient_id, payload, opts));
                if self.queue.len() >= self.config.batch_size {
                    self.process_batch();
                }
            }
            NotifyCommand::EnqueueBatch { items } => {
                for (kind, recipient_id, payload, opts) in items {
                    self.enqueue(Notification::new(kind, &recipient_id, payload, opts));
                }
                if self.queue.len() >= self.config.batch_size {
                    self.process_batch();
                }
            }
            NotifyCommand::ProcessNow => self.process_batch(),
            NotifyCommand::RetryFailed => self.retry_failed(),
            NotifyCommand::Delivered { id } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.sent += 1;
                debug!("✅ Notification {} sent", id);
            }
            NotifyCommand::DeliveryFailed {
                notification,
                error,
            } => self.on_delivery_failed(*notification, error),
            NotifyCommand::Stats { reply } => {
                let _ = reply.send(NotifyStats {
                    queued: self.queue.len(),
                    in_flight: self.in_flight,
                    failed: self.failed.len(),
                    sent: self.sent,
                });
            }
        }
    }

    fn enqueue(&mut self, notification: Notification) {
        // 记录落库不占用分发路径 / Record persistence stays off the dispatch path
        let store = self.store.clone();
        let record = notification.clone();
        tokio::spawn(async move {
            if let Err(e) = store.create_notification_record(&record).await {
                warn!("⚠️  Notification record write failed: {}", e);
            }
        });
        match notification.priority {
            NotificationPriority::High => self.queue.push_front(notification),
            _ => self.queue.push_back(notification),
        }
    }

    /// 拉取一批并按类型并发投递 / Pull one batch and dispatch concurrently by kind
    ///
    /// 计划在未来的通知被跳过而非投递 / Future-scheduled items are deferred, not sent
    fn process_batch(&mut self) {
        let now = Utc::now().timestamp_millis();
        let mut batch = Vec::new();
        let mut keep = VecDeque::new();
        while let Some(notification) = self.queue.pop_front() {
            if batch.len() < self.config.batch_size && notification.scheduled_for <= now {
                batch.push(notification);
            } else {
                keep.push_back(notification);
            }
        }
        self.queue = keep;
        if batch.is_empty() {
            return;
        }
        debug!("📤 Dispatching {} notifications", batch.len());
        for notification in batch {
            self.in_flight += 1;
            let strategy = self.strategies.get(&notification.kind).cloned();
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                let result = match strategy {
                    Some(strategy) => strategy.deliver(&notification).await,
                    None => Err(anyhow::anyhow!(
                        "no delivery strategy for {:?}",
                        notification.kind
                    )),
                };
                let cmd = match result {
                    Ok(()) => NotifyCommand::Delivered {
                        id: notification.id.clone(),
                    },
                    Err(e) => NotifyCommand::DeliveryFailed {
                        notification: Box::new(notification),
                        error: e.to_string(),
                    },
                };
                let _ = tx.send(cmd);
            });
        }
    }

    /// 失败处理：退避重排或移入失败列表 / Failure handling: backoff requeue or park in the failed list
    fn on_delivery_failed(&mut self, mut notification: Notification, error: String) {
        self.in_flight = self.in_flight.saturating_sub(1);
        notification.last_error = Some(error.clone());
        notification.retry_count += 1;
        if notification.retry_count < self.config.max_retries {
            let backoff = self.config.retry_base_ms * (1u64 << (notification.retry_count - 1));
            notification.scheduled_for = Utc::now().timestamp_millis() + backoff as i64;
            warn!(
                "🔁 Notification {} retry {}/{} in {}ms: {}",
                notification.id,
                notification.retry_count,
                self.config.max_retries,
                backoff,
                error
            );
            self.queue.push_back(notification);
        } else {
            warn!(
                "❌ Notification {} moved to failed list after {} retries: {}",
                notification.id, notification.retry_count, error
            );
            if self.failed.len() >= self.config.failed_list_cap {
                self.failed.pop_front();
            }
            self.failed.push_back(notification);
        }
    }

    /// 手动/定时重试失败列表 / Manual or scheduled retry of the failed list
    fn retry_failed(&mut self) {
        if self.failed.is_empty() {
            return;
        }
        info!("🔁 Requeueing {} failed notifications", self.failed.len());
        let now = Utc::now().timestamp_millis();
        while let Some(mut notification) = self.failed.pop_front() {
            notification.retry_count = 0;
            notification.scheduled_for = now;
            self.queue.push_back(notification);
        }
    }

    /// 清理超过保留期的失败记录 / Purge failed entries past retention
    fn sweep_failed(&mut self) {
        let cutoff = Utc::now().timestamp_millis() - self.config.failed_retention_ms;
        let before = self.failed.len();
        self.failed.retain(|n| n.created_at >= cutoff);
        let purged = before - self.failed.len();
        if purged > 0 {
            info!("🧹 Purged {} failed notifications past retention", purged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// 记录投递顺序并可注入失败的测试策略
    /// Test strategy recording dispatch order with failure injection
    struct RecordingStrategy {
        kind: NotificationKind,
        delivered: Arc<Mutex<Vec<String>>>,
        fail_times: Arc<Mutex<HashMap<String, u32>>>,
    }

    #[async_trait]
    impl DeliveryStrategy for RecordingStrategy {
        fn kind(&self) -> NotificationKind {
            self.kind
        }

        async fn deliver(&self, notification: &Notification) -> Result<()> {
            let mut fails = self.fail_times.lock();
            if let Some(remaining) = fails.get_mut(&notification.recipient_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("injected failure");
                }
            }
            drop(fails);
            self.delivered
                .lock()
                .push(notification.recipient_id.clone());
            Ok(())
        }
    }

    struct Ctx {
        dispatcher: NotificationDispatcherHandle,
        delivered: Arc<Mutex<Vec<String>>>,
        fail_times: Arc<Mutex<HashMap<String, u32>>>,
        _shutdown: watch::Sender<bool>,
    }

    fn setup(config: NotifyConfig) -> Ctx {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let fail_times: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut strategies: HashMap<NotificationKind, Arc<dyn DeliveryStrategy>> = HashMap::new();
        strategies.insert(
            NotificationKind::InApp,
            Arc::new(RecordingStrategy {
                kind: NotificationKind::InApp,
                delivered: delivered.clone(),
                fail_times: fail_times.clone(),
            }),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, _join) = spawn(
            config,
            strategies,
            Arc::new(MemoryStore::new()),
            shutdown_rx,
        );
        Ctx {
            dispatcher: NotificationDispatcherHandle::new(Mailbox::new(tx)),
            delivered,
            fail_times,
            _shutdown: shutdown_tx,
        }
    }

    fn fast_config() -> NotifyConfig {
        NotifyConfig {
            batch_size: 50,
            batch_interval_ms: 40,
            max_retries: 3,
            retry_base_ms: 20,
            failed_retention_ms: 86_400_000,
            failed_list_cap: 10,
            sweep_interval_ms: 60_000,
            webhook_timeout_ms: 1000,
            webhook_secret: None,
        }
    }

    #[tokio::test]
    async fn test_high_priority_dispatched_first() {
        let mut config = fast_config();
        config.batch_interval_ms = 60_000;
        let ctx = setup(config);

        for i in 0..3 {
            ctx.dispatcher.enqueue(
                NotificationKind::InApp,
                &format!("normal-{}", i),
                serde_json::json!({}),
                NotifyOptions::default(),
            );
        }
        ctx.dispatcher.enqueue(
            NotificationKind::InApp,
            "urgent",
            serde_json::json!({}),
            NotifyOptions {
                priority: NotificationPriority::High,
                scheduled_for: None,
            },
        );
        // 单线程运行时下投递任务按出队顺序执行，队首的高优先级先投出
        // On the current-thread runtime delivery tasks run in dequeue order,
        // so the high-priority item at the queue front goes out first
        ctx.dispatcher.process_now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let order = ctx.delivered.lock().clone();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "urgent");
    }

    #[tokio::test]
    async fn test_retry_with_backoff_then_success() {
        let ctx = setup(fast_config());
        ctx.fail_times.lock().insert("u1".into(), 2);
        ctx.dispatcher.enqueue(
            NotificationKind::InApp,
            "u1",
            serde_json::json!({}),
            NotifyOptions::default(),
        );
        // 两次失败后第三次投递成功 / Two failures, third attempt succeeds
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(ctx.delivered.lock().as_slice(), ["u1".to_string()]);
        let stats = ctx.dispatcher.stats().await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.sent, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_move_to_failed_list() {
        let ctx = setup(fast_config());
        ctx.fail_times.lock().insert("u1".into(), u32::MAX);
        ctx.dispatcher.enqueue(
            NotificationKind::InApp,
            "u1",
            serde_json::json!({}),
            NotifyOptions::default(),
        );
        tokio::time::sleep(Duration::from_millis(600)).await;
        let stats = ctx.dispatcher.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 0);
        assert!(ctx.delivered.lock().is_empty());

        // 失败后不再自动第4次重试 / No automatic 4th retry once parked
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = ctx.dispatcher.stats().await.unwrap();
        assert_eq!(stats.failed, 1);

        // 手动重试重新排队 / Manual retry requeues
        ctx.fail_times.lock().clear();
        ctx.dispatcher.retry_failed();
        ctx.dispatcher.process_now();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.delivered.lock().as_slice(), ["u1".to_string()]);
    }

    #[tokio::test]
    async fn test_scheduled_notification_deferred() {
        let ctx = setup(fast_config());
        ctx.dispatcher.enqueue(
            NotificationKind::InApp,
            "later",
            serde_json::json!({}),
            NotifyOptions {
                priority: NotificationPriority::Normal,
                scheduled_for: Some(Utc::now().timestamp_millis() + 200),
            },
        );
        ctx.dispatcher.process_now();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(ctx.delivered.lock().is_empty());

        // 到期后由定时批次投出 / Delivered by a later tick once due
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ctx.delivered.lock().as_slice(), ["later".to_string()]);
    }

    #[tokio::test]
    async fn test_enqueue_batch_and_size_trigger() {
        let mut config = fast_config();
        config.batch_size = 5;
        config.batch_interval_ms = 60_000;
        let ctx = setup(config);
        let items = (0..5)
            .map(|i| {
                (
                    NotificationKind::InApp,
                    format!("u-{}", i),
                    serde_json::json!({}),
                    NotifyOptions::default(),
                )
            })
            .collect();
        ctx.dispatcher.enqueue_batch(items);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(ctx.delivered.lock().len(), 5);
    }
}
