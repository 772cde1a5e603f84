//! 控制器模块
//!
//! 该模块把协调器接入 kube-rs 运行时：为 `Config`、`Addon` 与 `Namespace`
//! 分别启动一个运行时控制器。运行时保证同一资源不会被并发协调。

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller as KubeController},
        watcher,
    },
    ResourceExt,
};
use std::sync::Arc;
use tekton_common::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::ObjectKind;
use crate::crd::{Addon, Config};
use crate::reconcile::Reconciler;

/// 控制器结构体
pub struct Controller {
    /// Kubernetes 客户端
    client: Client,
    /// 协调器
    reconciler: Arc<Reconciler>,
    /// 运行中的控制器任务
    tasks: Vec<JoinHandle<()>>,
}

async fn reconcile_config(config: Arc<Config>, reconciler: Arc<Reconciler>) -> Result<Action, Error> {
    reconciler.reconcile_config(&config.name_any()).await
}

fn config_error_policy(config: Arc<Config>, error: &Error, reconciler: Arc<Reconciler>) -> Action {
    reconciler.handle_error(ObjectKind::Config, &config.name_any(), error)
}

async fn reconcile_addon(addon: Arc<Addon>, reconciler: Arc<Reconciler>) -> Result<Action, Error> {
    reconciler.reconcile_addon(&addon.name_any()).await
}

fn addon_error_policy(addon: Arc<Addon>, error: &Error, reconciler: Arc<Reconciler>) -> Action {
    reconciler.handle_error(ObjectKind::Addon, &addon.name_any(), error)
}

async fn reconcile_namespace(
    namespace: Arc<Namespace>,
    reconciler: Arc<Reconciler>,
) -> Result<Action, Error> {
    reconciler.reconcile_namespace(&namespace.name_any()).await
}

fn namespace_error_policy(
    namespace: Arc<Namespace>,
    error: &Error,
    reconciler: Arc<Reconciler>,
) -> Action {
    reconciler.handle_error(ObjectKind::Namespace, &namespace.name_any(), error)
}

impl Controller {
    /// 创建新的控制器
    pub fn new(client: Client, reconciler: Arc<Reconciler>) -> Self {
        Self {
            client,
            reconciler,
            tasks: Vec::new(),
        }
    }

    /// 启动控制器
    pub async fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            warn!("控制器已在运行");
            return Ok(());
        }

        let configs: Api<Config> = Api::all(self.client.clone());
        let addons: Api<Addon> = Api::all(self.client.clone());

        // 自定义资源定义必须已安装
        configs
            .list(&ListParams::default().limit(1))
            .await
            .context("Config CRD 未安装，请先执行 tekton-operator --crd | kubectl apply -f -")?;
        addons
            .list(&ListParams::default().limit(1))
            .await
            .context("Addon CRD 未安装，请先执行 tekton-operator --crd | kubectl apply -f -")?;

        let deployments: Api<Deployment> = Api::all(self.client.clone());
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        let config_controller = KubeController::new(configs, watcher::Config::default())
            .owns(deployments.clone(), watcher::Config::default())
            .run(reconcile_config, config_error_policy, self.reconciler.clone())
            .for_each(|result| async move {
                match result {
                    Ok((obj, _)) => debug!(object = %obj, "Config 协调完成"),
                    Err(e) => warn!(error = %e, "Config 协调失败"),
                }
            });

        let addon_controller = KubeController::new(addons, watcher::Config::default())
            .owns(deployments, watcher::Config::default())
            .run(reconcile_addon, addon_error_policy, self.reconciler.clone())
            .for_each(|result| async move {
                match result {
                    Ok((obj, _)) => debug!(object = %obj, "Addon 协调完成"),
                    Err(e) => warn!(error = %e, "Addon 协调失败"),
                }
            });

        let namespace_controller = KubeController::new(namespaces, watcher::Config::default())
            .run(reconcile_namespace, namespace_error_policy, self.reconciler.clone())
            .for_each(|result| async move {
                match result {
                    Ok((obj, _)) => debug!(object = %obj, "Namespace 协调完成"),
                    Err(e) => warn!(error = %e, "Namespace 协调失败"),
                }
            });

        self.tasks.push(tokio::spawn(config_controller));
        self.tasks.push(tokio::spawn(addon_controller));
        self.tasks.push(tokio::spawn(namespace_controller));

        info!("Tekton Operator 控制器已启动");
        Ok(())
    }

    /// 停止控制器
    pub async fn stop(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "控制器任务异常退出");
                }
            }
        }

        info!("Tekton Operator 控制器已停止");
        Ok(())
    }

    /// 控制器是否正在运行
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// 获取协调器
    pub fn get_reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }
}
