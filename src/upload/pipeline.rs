//! 上传处理流水线 / Upload processing pipeline
//!
//! 固定阶段：scan →（按类型）transform →（图像/视频）thumbnail → store。
//! 扫描命中为终态失败并隔离，绝不重试；其余失败视为瞬态。
//! Fixed stages: scan → type-specific transform → thumbnail (image/video
//! only) → store. A scan hit is terminal and quarantines the file, never
//! retried; every other failure is transient.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::message::{JobStatus, UploadJob, UploadOptions};
use crate::storage::UploadStore;

/// 扫描结论 / Scan verdict
///
/// Error是瞬态（计入重试预算），Infected是终态
/// Error is transient (counts against the retry budget), Infected is terminal
#[derive(Debug, Clone)]
pub enum ScanVerdict {
    Clean,
    Infected { signature: String },
    Error { reason: String },
}

#[async_trait]
pub trait VirusScanner: Send + Sync {
    async fn scan(&self, file_path: &str) -> ScanVerdict;
}

/// 媒体类型 / Media kind detected from the declared content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

pub fn media_kind(content_type: Option<&str>) -> MediaKind {
    let Some(content_type) = content_type else {
        return MediaKind::Other;
    };
    if content_type.starts_with("image/") {
        MediaKind::Image
    } else if content_type.starts_with("video/") {
        MediaKind::Video
    } else if content_type.starts_with("audio/") {
        MediaKind::Audio
    } else if content_type.starts_with("application/") || content_type.starts_with("text/") {
        MediaKind::Document
    } else {
        MediaKind::Other
    }
}

/// 转换输出 / Transform output
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub output_path: String,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait MediaTransformer: Send + Sync {
    /// 按类型转换：图像缩放、文档抽取、音视频处理
    /// Type-specific transform: image resize, document extraction, av processing
    async fn transform(
        &self,
        file_path: &str,
        kind: MediaKind,
        options: &UploadOptions,
    ) -> Result<TransformOutput>;
}

#[async_trait]
pub trait ThumbnailMaker: Send + Sync {
    async fn thumbnail(&self, file_path: &str) -> Result<String>;
}

/// 流水线产物 / Pipeline artifacts
#[derive(Debug, Clone)]
pub struct UploadArtifacts {
    pub output_path: String,
    pub thumbnail_path: Option<String>,
    pub metadata: serde_json::Value,
}

/// 任务结果 / Job outcome
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed { artifacts: UploadArtifacts },
    Infected { signature: String },
    Transient { reason: String },
}

/// 执行一个任务的完整流水线 / Run one job through the full pipeline
pub async fn run_pipeline(
    job: &UploadJob,
    scanner: &Arc<dyn VirusScanner>,
    transformer: &Arc<dyn MediaTransformer>,
    thumbnailer: &Arc<dyn ThumbnailMaker>,
    store: &Arc<dyn UploadStore>,
) -> JobOutcome {
    // 阶段1：病毒扫描 / Stage 1: virus scan
    match scanner.scan(&job.file_path).await {
        ScanVerdict::Clean => {}
        ScanVerdict::Infected { signature } => {
            warn!(
                "☣️  Upload {} quarantined, signature {}",
                job.upload_id, signature
            );
            return JobOutcome::Infected { signature };
        }
        ScanVerdict::Error { reason } => {
            return JobOutcome::Transient {
                reason: format!("scan: {}", reason),
            };
        }
    }

    // 阶段2：按类型转换 / Stage 2: type-specific transform
    let kind = media_kind(job.options.content_type.as_deref());
    let output = match transformer.transform(&job.file_path, kind, &job.options).await {
        Ok(output) => output,
        Err(e) => {
            return JobOutcome::Transient {
                reason: format!("transform: {}", e),
            };
        }
    };

    // 阶段3：缩略图，仅图像/视频 / Stage 3: thumbnail, image/video only
    let thumbnail_path = if job.options.generate_thumbnail
        && matches!(kind, MediaKind::Image | MediaKind::Video)
    {
        match thumbnailer.thumbnail(&output.output_path).await {
            Ok(path) => Some(path),
            Err(e) => {
                return JobOutcome::Transient {
                    reason: format!("thumbnail: {}", e),
                };
            }
        }
    } else {
        None
    };

    // 阶段4：交接持久层 / Stage 4: hand off to the persistence collaborator
    let metadata = serde_json::json!({
        "output_path": output.output_path,
        "thumbnail_path": thumbnail_path,
        "transform": output.metadata,
    });
    if let Err(e) = store
        .update_upload_status(&job.upload_id, &JobStatus::Completed, metadata.clone())
        .await
    {
        return JobOutcome::Transient {
            reason: format!("store: {}", e),
        };
    }

    info!("📦 Upload {} processed", job.upload_id);
    JobOutcome::Completed {
        artifacts: UploadArtifacts {
            output_path: output.output_path,
            thumbnail_path,
            metadata,
        },
    }
}

/// 默认接线用扫描器：视一切为干净 / Default wiring scanner: treats everything as clean
pub struct NoopScanner;

#[async_trait]
impl VirusScanner for NoopScanner {
    async fn scan(&self, _file_path: &str) -> ScanVerdict {
        ScanVerdict::Clean
    }
}

/// 按固定概率模拟命中的扫描器，仅用于演示与测试
/// Scanner simulating hits at a fixed probability, demos and tests only
pub struct RandomScanner {
    pub infection_rate: f64,
}

#[async_trait]
impl VirusScanner for RandomScanner {
    async fn scan(&self, file_path: &str) -> ScanVerdict {
        use rand::Rng;
        if rand::thread_rng().gen_bool(self.infection_rate) {
            ScanVerdict::Infected {
                signature: format!("simulated:{}", file_path),
            }
        } else {
            ScanVerdict::Clean
        }
    }
}

/// 原样转换器 / Passthrough transformer
pub struct PassthroughTransformer;

#[async_trait]
impl MediaTransformer for PassthroughTransformer {
    async fn transform(
        &self,
        file_path: &str,
        kind: MediaKind,
        _options: &UploadOptions,
    ) -> Result<TransformOutput> {
        debug!("🔧 Transforming {} as {:?}", file_path, kind);
        Ok(TransformOutput {
            output_path: file_path.to_string(),
            metadata: serde_json::json!({ "kind": format!("{:?}", kind) }),
        })
    }
}

/// 路径派生缩略图器 / Path-derived thumbnailer
pub struct PathThumbnailer;

#[async_trait]
impl ThumbnailMaker for PathThumbnailer {
    async fn thumbnail(&self, file_path: &str) -> Result<String> {
        Ok(format!("{}.thumb.jpg", file_path))
    }
}
