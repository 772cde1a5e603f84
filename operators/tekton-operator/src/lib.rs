//! Tekton Operator - Kubernetes Operator 自动化安装 Tekton Pipelines 及其插件
//!
//! 该模块实现了 Tekton 的 Kubernetes Operator：集群单例 `Config` 声明基础平台的
//! 安装目标，`Addon` 声明可选插件。协调器按依赖顺序安装、升级与卸载这些组件，
//! 并把结果以状态条件的形式写回自定义资源。

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod installer;
pub mod manifests;
pub mod rbac;
pub mod reconcile;
pub mod version;
pub mod waiter;

use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::cluster::{KubeClusterState, SharedClusterState};
use crate::config::OperatorConfig;
use crate::installer::ManifestInstaller;
use crate::reconcile::Reconciler;
use crate::version::VersionResolver;

/// Operator 主结构体
pub struct TektonOperator {
    /// Kubernetes 客户端
    client: Client,
    /// 控制器
    controller: Arc<RwLock<controller::Controller>>,
}

impl TektonOperator {
    /// 创建新的 Operator 实例
    pub async fn new(config: &OperatorConfig) -> Result<Self> {
        // 创建 Kubernetes 客户端
        let client = Client::try_default()
            .await
            .context("创建 Kubernetes 客户端失败")?;

        let cluster: SharedClusterState = Arc::new(KubeClusterState::new(client.clone()));
        let installer = Arc::new(ManifestInstaller::new(cluster.clone()));
        let resolver = VersionResolver::new(Arc::new(config.catalog()?));
        let reconciler = Arc::new(Reconciler::new(
            cluster,
            installer,
            resolver,
            config.reconcile_settings(),
        ));

        // 创建控制器
        let controller = Arc::new(RwLock::new(controller::Controller::new(
            client.clone(),
            reconciler,
        )));

        info!(
            pipeline_version = %config.pipeline_version,
            addons = config.catalog.len(),
            "Operator 已初始化"
        );

        Ok(Self { client, controller })
    }

    /// Kubernetes 客户端
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// 启动 Operator
    pub async fn start(&self) -> Result<()> {
        self.controller.write().await.start().await
    }

    /// 停止 Operator
    pub async fn stop(&self) -> Result<()> {
        self.controller.write().await.stop().await
    }

    /// Operator 是否正在运行
    pub async fn is_running(&self) -> bool {
        self.controller.read().await.is_running()
    }
}
