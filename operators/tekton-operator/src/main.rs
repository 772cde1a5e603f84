//! Tekton Operator 可执行入口

use anyhow::{Context, Result};
use clap::Parser;
use kube::CustomResourceExt;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tekton_operator::config::OperatorConfig;
use tekton_operator::crd::{Addon, Config};
use tekton_operator::TektonOperator;

/// Tekton Operator - 安装与管理 Tekton Pipelines 及其插件
#[derive(Parser, Debug)]
#[command(name = "tekton-operator", version, about, long_about = None)]
struct Args {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别，覆盖配置文件中的设置
    #[arg(long)]
    log_level: Option<String>,

    /// 输出自定义资源定义并退出
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.crd {
        let config_crd = serde_yaml::to_string(&Config::crd()).context("序列化 Config CRD 失败")?;
        let addon_crd = serde_yaml::to_string(&Addon::crd()).context("序列化 Addon CRD 失败")?;
        println!("{config_crd}---\n{addon_crd}");
        return Ok(());
    }

    let mut config = OperatorConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    // RUST_LOG 优先于配置中的日志级别
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "启动 Tekton Operator");

    let operator = TektonOperator::new(&config).await?;
    operator.start().await?;

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    info!("收到退出信号");

    operator.stop().await?;
    Ok(())
}
