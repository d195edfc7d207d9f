use anyhow::Result;
use serde::Deserialize;

/// 消息缓冲配置 / Message buffer configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub shutdown_drain_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval_ms: 5000,
            shutdown_drain_ms: 3000,
        }
    }
}

/// 在线状态配置 / Presence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub away_timeout_ms: u64,
    pub offline_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            away_timeout_ms: 300_000,
            offline_timeout_ms: 30_000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// 频道配置 / Channel configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub typing_ttl_ms: u64,
    pub recent_cache_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            typing_ttl_ms: 3000,
            recent_cache_size: 100,
        }
    }
}

/// 工作区配置 / Workspace configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub member_timeout_ms: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            member_timeout_ms: 300_000,
        }
    }
}

/// 通知分发配置 / Notification dispatch configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub failed_retention_ms: i64,
    pub failed_list_cap: usize,
    pub sweep_interval_ms: u64,
    /// Webhook投递超时 / Webhook delivery timeout
    pub webhook_timeout_ms: u64,
    /// Webhook签名密钥 / Webhook signing secret
    pub webhook_secret: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_interval_ms: 2000,
            max_retries: 3,
            retry_base_ms: 1000,
            failed_retention_ms: 86_400_000,
            failed_list_cap: 1000,
            sweep_interval_ms: 60_000,
            webhook_timeout_ms: 3000,
            webhook_secret: None,
        }
    }
}

/// 上传任务配置 / Upload job configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_concurrent_jobs: usize,
    pub max_retries: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            max_retries: 3,
        }
    }
}

/// 监督者配置 / Supervisor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: usize,
    pub restart_window_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window_ms: 60_000,
        }
    }
}

/// 核心配置 / Core configuration
///
/// 配置源优先级：默认值 < 配置文件 < 环境变量(VCHAT_*)
/// Source precedence: defaults < config file < env vars (VCHAT_*)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub node_id: Option<String>,
    pub buffer: BufferConfig,
    pub presence: PresenceConfig,
    pub channel: ChannelConfig,
    pub workspace: WorkspaceConfig,
    pub notify: NotifyConfig,
    pub upload: UploadConfig,
    pub supervisor: SupervisorConfig,
}

impl CoreConfig {
    /// 加载配置 / Load configuration
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("VCHAT").separator("__"))
            .build()?;
        let cfg: CoreConfig = settings.try_deserialize()?;
        Ok(cfg)
    }
}
