//! 消息缓冲 / Message buffer
//!
//! 累积出站消息写入并批量落库：满批或定时触发，失败保留重试
//! Accumulates outbound persistence writes into batches: flushed on size or
//! timer, retained and retried on failure

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::BufferConfig;
use crate::domain::message::BufferedMessage;
use crate::error::{CoreError, CoreResult};
use crate::registry::Mailbox;
use crate::storage::MessageStore;

/// 刷写结果 / Flush outcome
#[derive(Debug, Clone)]
pub struct FlushOutcome {
    pub flushed: usize,
}

/// 缓冲统计 / Buffer stats
#[derive(Debug, Clone)]
pub struct BufferStats {
    pub pending: usize,
    pub flush_errors: u64,
    pub total_flushed: u64,
}

pub enum BufferCommand {
    Enqueue {
        message_id: String,
        channel_id: String,
        user_id: String,
        content: String,
        metadata: serde_json::Value,
    },
    Flush {
        reply: Option<oneshot::Sender<CoreResult<FlushOutcome>>>,
    },
    /// 定时器到期（内部） / Armed flush timer fired (internal)
    FlushTimer,
    Stats {
        reply: oneshot::Sender<BufferStats>,
    },
}

/// 缓冲句柄 / Buffer handle
#[derive(Clone)]
pub struct MessageBufferHandle {
    mailbox: Mailbox<BufferCommand>,
}

impl MessageBufferHandle {
    pub fn new(mailbox: Mailbox<BufferCommand>) -> Self {
        Self { mailbox }
    }

    pub fn enqueue(
        &self,
        message_id: &str,
        channel_id: &str,
        user_id: &str,
        content: &str,
        metadata: serde_json::Value,
    ) {
        self.mailbox.send(BufferCommand::Enqueue {
            message_id: message_id.to_string(),
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            metadata,
        });
    }

    pub async fn flush(&self) -> CoreResult<FlushOutcome> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(BufferCommand::Flush { reply: Some(tx) }) {
            return Err(CoreError::ActorUnavailable {
                name: "message_buffer".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "message_buffer".into(),
        })?
    }

    pub async fn stats(&self) -> CoreResult<BufferStats> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(BufferCommand::Stats { reply: tx }) {
            return Err(CoreError::ActorUnavailable {
                name: "message_buffer".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "message_buffer".into(),
        })
    }
}

/// 消息缓冲actor / Message buffer actor
struct MessageBuffer {
    config: BufferConfig,
    store: Arc<dyn MessageStore>,
    buffer: Vec<BufferedMessage>,
    /// 唯一的待刷写定时器 / The single pending flush timer
    flush_timer: Option<JoinHandle<()>>,
    flush_errors: u64,
    total_flushed: u64,
    self_tx: mpsc::UnboundedSender<BufferCommand>,
}

/// 启动缓冲actor / Spawn the buffer actor
pub fn spawn(
    config: BufferConfig,
    store: Arc<dyn MessageStore>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> (mpsc::UnboundedSender<BufferCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let self_tx = tx.clone();
    let join = tokio::spawn(async move {
        let mut actor = MessageBuffer {
            config,
            store,
            buffer: Vec::new(),
            flush_timer: None,
            flush_errors: 0,
            total_flushed: 0,
            self_tx,
        };
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => actor.handle(cmd).await,
                        None => break,
                    }
                }
                changed = shutdown_rx.changed() => {
                    // 发送端消失等同关停 / A dropped sender counts as shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        actor.drain_on_shutdown().await;
                        break;
                    }
                }
            }
        }
    });
    (tx, join)
}

impl MessageBuffer {
    async fn handle(&mut self, cmd: BufferCommand) {
        match cmd {
            BufferCommand::Enqueue {
                message_id,
                channel_id,
                user_id,
                content,
                metadata,
            } => {
                self.buffer.push(BufferedMessage {
                    message_id,
                    channel_id,
                    user_id,
                    content,
                    buffered_at: Utc::now().timestamp_millis(),
                    metadata,
                });
                if self.buffer.len() == 1 {
                    self.arm_timer();
                }
                if self.buffer.len() >= self.config.batch_size {
                    if let Err(e) = self.do_flush().await {
                        warn!("⚠️  Size-triggered flush failed, batch retained: {}", e);
                    }
                }
            }
            BufferCommand::Flush { reply } => {
                let result = self.do_flush().await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            BufferCommand::FlushTimer => {
                if let Err(e) = self.do_flush().await {
                    warn!("⚠️  Timed flush failed, batch retained: {}", e);
                }
            }
            BufferCommand::Stats { reply } => {
                let _ = reply.send(BufferStats {
                    pending: self.buffer.len(),
                    flush_errors: self.flush_errors,
                    total_flushed: self.total_flushed,
                });
            }
        }
    }

    /// 执行一次批量落库 / Perform one batched durable write
    ///
    /// 失败时批次不清空，重新武装定时器以便重试
    /// On failure the batch is not cleared; the timer is re-armed for retry
    async fn do_flush(&mut self) -> CoreResult<FlushOutcome> {
        if self.buffer.is_empty() {
            self.cancel_timer();
            return Ok(FlushOutcome { flushed: 0 });
        }
        match self.store.batch_insert(&self.buffer).await {
            Ok(written) => {
                debug!("💾 Flushed {} buffered messages", written);
                self.total_flushed += written as u64;
                self.buffer.clear();
                self.cancel_timer();
                Ok(FlushOutcome { flushed: written })
            }
            Err(e) => {
                self.flush_errors += 1;
                self.arm_timer();
                Err(CoreError::storage(e.to_string()))
            }
        }
    }

    /// 关停时有界限期内尽力清空 / Best-effort drain within a hard deadline on shutdown
    async fn drain_on_shutdown(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let pending = self.buffer.len();
        let deadline = Duration::from_millis(self.config.shutdown_drain_ms);
        match tokio::time::timeout(deadline, self.store.batch_insert(&self.buffer)).await {
            Ok(Ok(written)) => {
                info!("💾 Drained {} buffered messages on shutdown", written);
                self.buffer.clear();
            }
            Ok(Err(e)) => {
                error!("❌ Shutdown drain failed, {} messages lost: {}", pending, e);
            }
            Err(_) => {
                error!("❌ Shutdown drain exceeded deadline, {} messages lost", pending);
            }
        }
        self.cancel_timer();
    }

    /// 取消并替换唯一的刷写定时器 / Cancel-and-replace the single flush timer
    fn arm_timer(&mut self) {
        self.cancel_timer();
        let tx = self.self_tx.clone();
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        self.flush_timer = Some(tokio::spawn(async move {
            sleep(interval).await;
            let _ = tx.send(BufferCommand::FlushTimer);
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
    }
}
