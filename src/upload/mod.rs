//! 上传任务调度 / Upload job scheduling
//!
//! 优先级队列+有界并发：最多max_concurrent_jobs个任务同时处理，
//! 槽位释放即出队下一个；满载时新提交在队列中等待（背压）
//! Priority queue + bounded concurrency: at most max_concurrent_jobs
//! processing at once, the next job dequeues as a slot frees; submissions
//! past capacity wait in the queue (backpressure)

pub mod pipeline;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use crate::bus::SharedBus;
use crate::config::UploadConfig;
use crate::domain::event::{kinds, topics};
use crate::domain::message::{JobPriority, JobStatus, UploadJob, UploadOptions};
use crate::error::CoreError;
use crate::registry::Mailbox;
use crate::storage::UploadStore;
use pipeline::{JobOutcome, MediaTransformer, ThumbnailMaker, VirusScanner};

/// 调度统计 / Scheduler stats
#[derive(Debug, Clone)]
pub struct UploadStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
}

pub enum UploadCommand {
    Submit {
        upload_id: String,
        file_path: String,
        options: UploadOptions,
        reply: Option<oneshot::Sender<String>>,
    },
    Status {
        upload_id: String,
        reply: oneshot::Sender<Option<JobStatus>>,
    },
    Cancel {
        job_id: String,
        reply: oneshot::Sender<bool>,
    },
    /// 任务结束（内部） / Job finished (internal)
    JobFinished {
        job_id: String,
        outcome: JobOutcome,
    },
    Stats {
        reply: oneshot::Sender<UploadStats>,
    },
}

/// 调度器句柄 / Scheduler handle
#[derive(Clone)]
pub struct UploadSchedulerHandle {
    mailbox: Mailbox<UploadCommand>,
}

impl UploadSchedulerHandle {
    pub fn new(mailbox: Mailbox<UploadCommand>) -> Self {
        Self { mailbox }
    }

    /// 提交任务，返回job id / Submit a job, returns the job id
    pub async fn submit(
        &self,
        upload_id: &str,
        file_path: &str,
        options: UploadOptions,
    ) -> Result<String, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(UploadCommand::Submit {
            upload_id: upload_id.to_string(),
            file_path: file_path.to_string(),
            options,
            reply: Some(tx),
        }) {
            return Err(CoreError::ActorUnavailable {
                name: "upload_scheduler".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "upload_scheduler".into(),
        })
    }

    pub async fn status(&self, upload_id: &str) -> Result<Option<JobStatus>, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(UploadCommand::Status {
            upload_id: upload_id.to_string(),
            reply: tx,
        }) {
            return Err(CoreError::ActorUnavailable {
                name: "upload_scheduler".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "upload_scheduler".into(),
        })
    }

    /// 取消任务：出队或强停在途任务 / Cancel: remove a queued job or kill an in-flight one
    pub async fn cancel(&self, job_id: &str) -> Result<bool, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(UploadCommand::Cancel {
            job_id: job_id.to_string(),
            reply: tx,
        }) {
            return Err(CoreError::ActorUnavailable {
                name: "upload_scheduler".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "upload_scheduler".into(),
        })
    }

    pub async fn stats(&self) -> Result<UploadStats, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(UploadCommand::Stats { reply: tx }) {
            return Err(CoreError::ActorUnavailable {
                name: "upload_scheduler".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "upload_scheduler".into(),
        })
    }
}

/// 在途任务 / In-flight job
struct RunningJob {
    job: UploadJob,
    abort: AbortHandle,
}

struct UploadScheduler {
    config: UploadConfig,
    bus: SharedBus,
    scanner: Arc<dyn VirusScanner>,
    transformer: Arc<dyn MediaTransformer>,
    thumbnailer: Arc<dyn ThumbnailMaker>,
    store: Arc<dyn UploadStore>,
    queue: VecDeque<UploadJob>,
    /// 私有状态，仅由本actor的顺序消息循环修改
    /// Private state, mutated only by this actor's sequential loop
    running: HashMap<String, RunningJob>,
    statuses: HashMap<String, JobStatus>,
    completed: u64,
    failed: u64,
    self_tx: mpsc::UnboundedSender<UploadCommand>,
}

/// 启动上传调度actor / Spawn the upload scheduler actor
pub fn spawn(
    config: UploadConfig,
    bus: SharedBus,
    scanner: Arc<dyn VirusScanner>,
    transformer: Arc<dyn MediaTransformer>,
    thumbnailer: Arc<dyn ThumbnailMaker>,
    store: Arc<dyn UploadStore>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> (mpsc::UnboundedSender<UploadCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let self_tx = tx.clone();
    let join = tokio::spawn(async move {
        let mut actor = UploadScheduler {
            config,
            bus,
            scanner,
            transformer,
            thumbnailer,
            store,
            queue: VecDeque::new(),
            running: HashMap::new(),
            statuses: HashMap::new(),
            completed: 0,
            failed: 0,
            self_tx,
        };
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => actor.handle(cmd),
                        None => break,
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
        // 关停时终止在途任务 / Kill in-flight jobs on shutdown
        for (_, running) in actor.running.drain() {
            running.abort.abort();
        }
    });
    (tx, join)
}

impl UploadScheduler {
    fn handle(&mut self, cmd: UploadCommand) {
        match cmd {
            UploadCommand::Submit {
                upload_id,
                file_path,
                options,
                reply,
            } => {
                let job = UploadJob::new(&upload_id, &file_path, options);
                let job_id = job.id.clone();
                self.statuses.insert(upload_id, JobStatus::Queued);
                self.enqueue(job);
                self.try_start();
                if let Some(reply) = reply {
                    let _ = reply.send(job_id);
                }
            }
            UploadCommand::Status { upload_id, reply } => {
                let _ = reply.send(self.statuses.get(&upload_id).cloned());
            }
            UploadCommand::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel(&job_id));
            }
            UploadCommand::JobFinished { job_id, outcome } => self.on_finished(&job_id, outcome),
            UploadCommand::Stats { reply } => {
                let _ = reply.send(UploadStats {
                    queued: self.queue.len(),
                    running: self.running.len(),
                    completed: self.completed,
                    failed: self.failed,
                });
            }
        }
    }

    fn enqueue(&mut self, job: UploadJob) {
        match job.options.priority {
            JobPriority::High => self.queue.push_front(job),
            JobPriority::Normal => self.queue.push_back(job),
        }
    }

    /// 槽位允许时出队启动 / Dequeue and start while slots allow
    fn try_start(&mut self) {
        while self.running.len() < self.config.max_concurrent_jobs {
            let Some(mut job) = self.queue.pop_front() else {
                break;
            };
            job.status = JobStatus::Processing;
            self.statuses
                .insert(job.upload_id.clone(), JobStatus::Processing);

            let scanner = self.scanner.clone();
            let transformer = self.transformer.clone();
            let thumbnailer = self.thumbnailer.clone();
            let store = self.store.clone();
            let tx = self.self_tx.clone();
            let task_job = job.clone();
            let handle = tokio::spawn(async move {
                let outcome = pipeline::run_pipeline(
                    &task_job,
                    &scanner,
                    &transformer,
                    &thumbnailer,
                    &store,
                )
                .await;
                let _ = tx.send(UploadCommand::JobFinished {
                    job_id: task_job.id.clone(),
                    outcome,
                });
            });
            self.running.insert(
                job.id.clone(),
                RunningJob {
                    job,
                    abort: handle.abort_handle(),
                },
            );
        }
    }

    fn on_finished(&mut self, job_id: &str, outcome: JobOutcome) {
        // 已被取消的任务不再处理 / A cancelled job is gone already
        let Some(running) = self.running.remove(job_id) else {
            return;
        };
        let mut job = running.job;
        match outcome {
            JobOutcome::Completed { artifacts } => {
                self.completed += 1;
                self.statuses
                    .insert(job.upload_id.clone(), JobStatus::Completed);
                self.bus.emit(
                    topics::UPLOADS,
                    kinds::UPLOAD_COMPLETED,
                    serde_json::json!({
                        "upload_id": job.upload_id,
                        "job_id": job.id,
                        "submitter_id": job.options.submitter_id,
                        "output_path": artifacts.output_path,
                        "thumbnail_path": artifacts.thumbnail_path,
                    }),
                );
            }
            JobOutcome::Infected { signature } => {
                // 终态：隔离，零重试 / Terminal: quarantined, zero retries
                self.failed += 1;
                self.fail_job(&job, "virus_detected", Some(signature));
            }
            JobOutcome::Transient { reason } => {
                job.retry_count += 1;
                if job.retry_count < self.config.max_retries {
                    info!(
                        "🔁 Upload job {} retry {}/{}: {}",
                        job.id, job.retry_count, self.config.max_retries, reason
                    );
                    job.status = JobStatus::Queued;
                    self.statuses
                        .insert(job.upload_id.clone(), JobStatus::Queued);
                    self.queue.push_back(job);
                } else {
                    self.failed += 1;
                    self.fail_job(&job, &reason, None);
                }
            }
        }
        self.try_start();
    }

    /// 标记失败并通知提交者 / Mark failed and notify the submitter via the bus
    fn fail_job(&mut self, job: &UploadJob, reason: &str, signature: Option<String>) {
        let status = JobStatus::Failed {
            reason: reason.to_string(),
        };
        self.statuses.insert(job.upload_id.clone(), status.clone());
        let store = self.store.clone();
        let upload_id = job.upload_id.clone();
        let meta = serde_json::json!({ "reason": reason, "signature": signature });
        tokio::spawn(async move {
            if let Err(e) = store.update_upload_status(&upload_id, &status, meta).await {
                warn!("⚠️  Upload status write failed for {}: {}", upload_id, e);
            }
        });
        self.bus.emit(
            topics::UPLOADS,
            kinds::UPLOAD_FAILED,
            serde_json::json!({
                "upload_id": job.upload_id,
                "job_id": job.id,
                "submitter_id": job.options.submitter_id,
                "error": reason,
                "retry_count": job.retry_count,
            }),
        );
        warn!("❌ Upload job {} failed: {}", job.id, reason);
    }

    fn cancel(&mut self, job_id: &str) -> bool {
        // 排队任务直接出队 / A queued job is removed outright
        if let Some(idx) = self.queue.iter().position(|j| j.id == job_id) {
            if let Some(job) = self.queue.remove(idx) {
                self.statuses
                    .insert(job.upload_id.clone(), JobStatus::Cancelled);
                self.publish_cancelled(&job);
            }
            return true;
        }
        // 在途任务强制终止并释放槽位 / An in-flight job is killed, freeing its slot
        if let Some(running) = self.running.remove(job_id) {
            running.abort.abort();
            self.statuses
                .insert(running.job.upload_id.clone(), JobStatus::Cancelled);
            self.publish_cancelled(&running.job);
            self.try_start();
            return true;
        }
        // 未知任务：本地拒绝 / Unknown job: rejected locally
        warn!("🚫 Cancel of unknown job {}", job_id);
        false
    }

    fn publish_cancelled(&self, job: &UploadJob) {
        self.bus.emit(
            topics::UPLOADS,
            kinds::UPLOAD_CANCELLED,
            serde_json::json!({
                "upload_id": job.upload_id,
                "job_id": job.id,
                "submitter_id": job.options.submitter_id,
            }),
        );
    }
}
