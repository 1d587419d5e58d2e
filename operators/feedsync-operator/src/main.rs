use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use feedsync_controller::ControllerConfig;
use feedsync_operator::Operator;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// FeedSync Operator 命令行参数
#[derive(Parser, Debug)]
#[command(name = "feedsync-operator", version, about = "威胁源同步 Operator")]
struct Cli {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long, env = "FEEDSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// 覆盖配置中的日志级别
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ControllerConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    setup_subscriber(&config.log_level);

    let client = Client::try_default()
        .await
        .context("无法创建 Kubernetes 客户端")?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    Operator::new(client, config).run(token).await?;
    info!("退出");
    Ok(())
}

fn setup_subscriber(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "无法监听 Ctrl+C 信号");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "无法监听 SIGTERM 信号");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl+C 信号"),
        _ = terminate => info!("收到 SIGTERM 信号"),
    }
}
