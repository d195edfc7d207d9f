use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use v_chat_core::{Collaborators, CoreConfig, CoreSupervisor};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-chat-core real-time coordination server", long_about = None)]
pub struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// 日志级别 / Log level
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!("🎯 Starting v-chat-core coordination server...");

    let config = CoreConfig::load(args.config.as_deref())?;
    if let Some(path) = &args.config {
        info!("🔧 Loaded config file: {}", path);
    }

    // 进程内默认接线；真实部署将协作方换成持久层/身份/扫描服务的客户端
    // In-process default wiring; a real deployment swaps the collaborators for
    // persistence/identity/scanner clients
    let supervisor = CoreSupervisor::start(config, Collaborators::in_memory())?;

    let report = supervisor.health_check();
    info!(
        "🩺 {} services up, healthy={}",
        report.services.len(),
        report.healthy
    );

    // 等待终止信号后优雅关停 / Graceful shutdown on termination signal
    tokio::signal::ctrl_c().await?;
    supervisor.shutdown().await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    info!("✅ Server shutdown successfully");
    Ok(())
}
