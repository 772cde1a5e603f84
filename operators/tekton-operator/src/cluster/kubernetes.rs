//! 基于 kube-rs 的集群状态客户端
//!
//! 通过 `Api<DynamicObject>` 访问真实集群，并把 API 错误映射到统一的错误分类。

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::DynamicObject;
use kube::Client;
use tekton_common::{Error, Result};
use tracing::debug;

use super::{selector_string, ClusterState, Labels, ObjectKind};

/// kube-rs 实现的集群状态客户端
#[derive(Clone)]
pub struct KubeClusterState {
    /// Kubernetes 客户端
    client: Client,
}

impl KubeClusterState {
    /// 创建新的客户端
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// 构造指定类型的动态 API
    fn api(&self, kind: ObjectKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }
}

/// 将 kube-rs 错误映射为统一错误
fn map_error(err: kube::Error, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(kind.as_str(), namespace, name),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::already_exists(kind.as_str(), namespace, name)
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::conflict(kind.as_str(), namespace, name),
        other => Error::Transient(other.to_string()),
    }
}

fn object_name(kind: ObjectKind, obj: &DynamicObject) -> Result<String> {
    obj.metadata
        .name
        .clone()
        .ok_or_else(|| Error::InvalidSpec(format!("{} 缺少 metadata.name", kind)))
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn create(&self, kind: ObjectKind, obj: DynamicObject) -> Result<DynamicObject> {
        let name = object_name(kind, &obj)?;
        let namespace = obj.metadata.namespace.clone();
        debug!(kind = %kind, namespace = ?namespace, name = %name, "创建对象");

        self.api(kind, namespace.as_deref())
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_error(e, kind, namespace.as_deref(), &name))
    }

    async fn get(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        self.api(kind, namespace)
            .get(name)
            .await
            .map_err(|e| map_error(e, kind, namespace, name))
    }

    async fn delete(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Result<()> {
        debug!(kind = %kind, namespace = ?namespace, name = %name, "删除对象");

        // 后台级联删除，依赖方由垃圾回收器按所有者引用清理
        self.api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, kind, namespace, name))
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        selector: &Labels,
    ) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(&selector_string(selector));
        let list = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(|e| map_error(e, kind, namespace, "*"))?;

        Ok(list.items)
    }

    async fn update(&self, kind: ObjectKind, obj: DynamicObject) -> Result<DynamicObject> {
        let name = object_name(kind, &obj)?;
        let namespace = obj.metadata.namespace.clone();

        self.api(kind, namespace.as_deref())
            .replace(&name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_error(e, kind, namespace.as_deref(), &name))
    }

    async fn update_status(&self, kind: ObjectKind, obj: DynamicObject) -> Result<DynamicObject> {
        let name = object_name(kind, &obj)?;
        let namespace = obj.metadata.namespace.clone();
        let body = serde_json::to_vec(&obj)?;

        self.api(kind, namespace.as_deref())
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| map_error(e, kind, namespace.as_deref(), &name))
    }
}
