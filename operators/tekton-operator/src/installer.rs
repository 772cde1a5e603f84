//! 组件安装器模块
//!
//! 安装器负责把一个组件的全部对象写入集群，或删除这些对象。协调引擎只通过
//! `Installer` 接口与其交互，测试中可以替换为 mock 实现。

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use tekton_common::Result;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::cluster::{delete_if_exists, get_opt, ObjectKey, ObjectKind, SharedClusterState};
use crate::manifests::{render, Component};

/// 组件安装器
///
/// 两个操作都是幂等的：中途失败后再次调用会补全剩余部分。
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// 把组件的指定版本安装到目标命名空间，所有对象带上 `owner` 引用
    async fn apply(
        &self,
        component: &Component,
        target_namespace: &str,
        version: &str,
        owner: &OwnerReference,
    ) -> Result<()>;

    /// 删除组件在目标命名空间中的全部对象，对象不存在视为成功
    async fn remove(&self, component: &Component, target_namespace: &str) -> Result<()>;
}

/// 基于内置清单的安装器
pub struct ManifestInstaller {
    client: SharedClusterState,
}

impl ManifestInstaller {
    pub fn new(client: SharedClusterState) -> Self {
        Self { client }
    }

    /// 创建或更新单个对象
    async fn apply_object(&self, kind: ObjectKind, desired: DynamicObject) -> Result<()> {
        let key = ObjectKey::of(kind, &desired)?;

        match get_opt(self.client.as_ref(), kind, key.namespace(), &key.name).await? {
            None => {
                debug!(object = %key, "创建组件对象");
                self.client.create(kind, desired).await?;
            }
            Some(existing) if needs_update(&existing, &desired) => {
                debug!(object = %key, "更新组件对象");
                let mut desired = desired;
                desired.metadata.resource_version = existing.metadata.resource_version.clone();
                desired.metadata.finalizers = existing.metadata.finalizers.clone();
                self.client.update(kind, desired).await?;
            }
            Some(_) => {
                debug!(object = %key, "组件对象已是最新");
            }
        }

        Ok(())
    }
}

/// 现有对象与期望对象是否存在差异（忽略状态与服务端元数据）
fn needs_update(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    if existing.metadata.labels != desired.metadata.labels
        || existing.metadata.owner_references != desired.metadata.owner_references
    {
        return true;
    }

    let mut current = existing.data.clone();
    if let Some(fields) = current.as_object_mut() {
        fields.remove("status");
    }
    let mut wanted = desired.data.clone();
    if let Some(fields) = wanted.as_object_mut() {
        fields.remove("status");
    }
    current != wanted
}

#[async_trait]
impl Installer for ManifestInstaller {
    async fn apply(
        &self,
        component: &Component,
        target_namespace: &str,
        version: &str,
        owner: &OwnerReference,
    ) -> Result<()> {
        info!(component = %component, namespace = %target_namespace, version = %version, "安装组件");

        for manifest in render(component, target_namespace, version)? {
            let mut object = manifest.object;
            object.metadata.owner_references = Some(vec![owner.clone()]);
            self.apply_object(manifest.kind, object).await?;
        }

        Ok(())
    }

    async fn remove(&self, component: &Component, target_namespace: &str) -> Result<()> {
        info!(component = %component, namespace = %target_namespace, "删除组件");

        let selector = component.selector();
        for kind in ObjectKind::INSTALLABLE {
            for obj in self.client.list(kind, Some(target_namespace), &selector).await? {
                let key = ObjectKey::of(kind, &obj)?;
                if delete_if_exists(self.client.as_ref(), kind, key.namespace(), &key.name).await? {
                    debug!(object = %key, "已删除组件对象");
                }
            }
        }

        Ok(())
    }
}
