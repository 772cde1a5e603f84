//! 内存集群状态
//!
//! 在进程内模拟 Kubernetes API 服务器的关键语义，用于确定性测试：
//! 资源版本与乐观并发、UID、带 finalizer 的延迟删除、基于所有者引用的垃圾回收，
//! 以及可选的 Deployment 自动就绪（模拟 Deployment 控制器与 kubelet）。关闭自动就绪时，
//! 修改过的 Deployment 保留旧的 `status.observedGeneration`，直到手动标记就绪。

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use serde_json::json;
use std::collections::BTreeMap;
use tekton_common::{Error, Result};
use tokio::sync::RwLock;
use tracing::trace;

use super::{matches_labels, ClusterState, Labels, ObjectKey, ObjectKind};

/// 内存集群
pub struct MemoryCluster {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    next_version: u64,
    next_uid: u64,
    /// 创建或更新 Deployment 时是否立即标记为就绪
    auto_ready: bool,
    /// 待注入的写入冲突次数
    pending_conflicts: u32,
    /// 写操作计数（create/update/update_status/delete）
    writes: u64,
}

impl MemoryState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_conflict(&mut self) -> bool {
        if self.pending_conflicts > 0 {
            self.pending_conflicts -= 1;
            true
        } else {
            false
        }
    }

    /// 删除对象并级联删除其拥有的对象
    fn remove_cascading(&mut self, key: &ObjectKey) {
        let removed = match self.objects.remove(key) {
            Some(obj) => obj,
            None => return,
        };
        trace!(object = %key, "对象已从内存集群移除");

        let uid = match removed.metadata.uid {
            Some(uid) => uid,
            None => return,
        };

        let dependents: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|(_, obj)| super::is_owned_by(obj, &uid))
            .map(|(k, _)| k.clone())
            .collect();

        for dependent in dependents {
            self.mark_deleted(&dependent);
        }
    }

    /// 标记删除：有 finalizer 时仅设置删除时间戳，否则立即移除
    fn mark_deleted(&mut self, key: &ObjectKey) {
        let has_finalizers = match self.objects.get(key) {
            Some(obj) => obj
                .metadata
                .finalizers
                .as_ref()
                .map(|f| !f.is_empty())
                .unwrap_or(false),
            None => return,
        };

        if has_finalizers {
            let version = self.bump_version();
            if let Some(obj) = self.objects.get_mut(key) {
                if obj.metadata.deletion_timestamp.is_none() {
                    obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                }
                obj.metadata.resource_version = Some(version);
            }
        } else {
            self.remove_cascading(key);
        }
    }

    fn check_version(&self, key: &ObjectKey, incoming: &DynamicObject) -> Result<()> {
        let stored = self
            .objects
            .get(key)
            .ok_or_else(|| Error::not_found(key.kind.as_str(), key.namespace(), &key.name))?;

        match &incoming.metadata.resource_version {
            Some(v) if Some(v) != stored.metadata.resource_version.as_ref() => Err(Error::conflict(
                key.kind.as_str(),
                key.namespace(),
                &key.name,
            )),
            _ => Ok(()),
        }
    }
}

/// 把 Deployment 的就绪副本数设置为期望副本数
fn mark_deployment_ready(obj: &mut DynamicObject) {
    let replicas = obj.data["spec"]["replicas"].as_i64().unwrap_or(1);
    set_ready_replicas(obj, replicas);
}

/// 模拟 Deployment 控制器完成当前 generation 的滚动更新
fn set_ready_replicas(obj: &mut DynamicObject, ready: i64) {
    let generation = obj.metadata.generation.unwrap_or(1);
    if !obj.data.is_object() {
        obj.data = json!({});
    }
    obj.data["status"] = json!({
        "observedGeneration": generation,
        "replicas": ready,
        "readyReplicas": ready,
        "availableReplicas": ready,
        "updatedReplicas": ready,
    });
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// 创建空的内存集群
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// 创建 Deployment 会自动就绪的内存集群
    pub fn with_auto_ready() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                auto_ready: true,
                ..Default::default()
            }),
        }
    }

    /// 开启或关闭 Deployment 自动就绪
    pub async fn set_auto_ready(&self, enabled: bool) {
        self.state.write().await.auto_ready = enabled;
    }

    /// 手动设置 Deployment 的就绪副本数
    pub async fn set_ready_replicas(&self, namespace: &str, name: &str, ready: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let key = ObjectKey::new(ObjectKind::Deployment, Some(namespace), name);
        let version = state.bump_version();
        let obj = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("Deployment", Some(namespace), name))?;
        set_ready_replicas(obj, ready);
        obj.metadata.resource_version = Some(version);
        Ok(())
    }

    /// 让接下来的 `n` 次更新返回冲突
    pub async fn inject_conflicts(&self, n: u32) {
        self.state.write().await.pending_conflicts = n;
    }

    /// 对象是否存在
    pub async fn contains(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> bool {
        let key = ObjectKey::new(kind, namespace, name);
        self.state.read().await.objects.contains_key(&key)
    }

    /// 当前所有对象的标识
    pub async fn keys(&self) -> Vec<ObjectKey> {
        self.state.read().await.objects.keys().cloned().collect()
    }

    /// 累计写操作次数
    pub async fn write_count(&self) -> u64 {
        self.state.read().await.writes
    }
}

#[async_trait]
impl ClusterState for MemoryCluster {
    async fn create(&self, kind: ObjectKind, mut obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.write().await;
        let key = ObjectKey::of(kind, &obj)?;

        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(kind.as_str(), key.namespace(), &key.name));
        }

        state.next_uid += 1;
        let uid = format!("{:08x}-{}", state.next_uid, uuid::Uuid::new_v4());
        obj.metadata.uid = Some(uid);
        obj.metadata.namespace = key.namespace.clone();
        obj.metadata.resource_version = Some(state.bump_version());
        obj.metadata.generation = Some(1);
        obj.metadata.creation_timestamp = Some(Time(Utc::now()));
        obj.metadata.deletion_timestamp = None;

        if kind == ObjectKind::Deployment && state.auto_ready {
            mark_deployment_ready(&mut obj);
        }

        state.writes += 1;
        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn get(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        let key = ObjectKey::new(kind, namespace, name);
        self.state
            .read()
            .await
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(kind.as_str(), key.namespace(), name))
    }

    async fn delete(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let key = ObjectKey::new(kind, namespace, name);

        if !state.objects.contains_key(&key) {
            return Err(Error::not_found(kind.as_str(), key.namespace(), name));
        }

        state.writes += 1;
        state.mark_deleted(&key);
        Ok(())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        selector: &Labels,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state.read().await;
        let items = state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| match namespace {
                Some(ns) if kind.is_namespaced() => key.namespace() == Some(ns),
                _ => true,
            })
            .filter(|(_, obj)| matches_labels(obj, selector))
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(items)
    }

    async fn update(&self, kind: ObjectKind, obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.write().await;
        let key = ObjectKey::of(kind, &obj)?;
        state.check_version(&key, &obj)?;
        if state.take_conflict() {
            return Err(Error::conflict(kind.as_str(), key.namespace(), &key.name));
        }

        let version = state.bump_version();
        let auto_ready = state.auto_ready;
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(kind.as_str(), key.namespace(), &key.name))?;

        // 主资源更新不改变状态与服务端维护的元数据
        let status = stored.data.get("status").cloned();
        let spec_changed = stored.data.get("spec") != obj.data.get("spec");
        let mut updated = obj;
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.namespace = key.namespace.clone();
        updated.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        updated.metadata.resource_version = Some(version);
        updated.metadata.generation =
            Some(stored.metadata.generation.unwrap_or(1) + i64::from(spec_changed));
        match status {
            Some(status) => {
                if !updated.data.is_object() {
                    updated.data = json!({});
                }
                updated.data["status"] = status;
            }
            None => {
                if let Some(data) = updated.data.as_object_mut() {
                    data.remove("status");
                }
            }
        }
        if kind == ObjectKind::Deployment && auto_ready {
            mark_deployment_ready(&mut updated);
        }
        *stored = updated.clone();
        state.writes += 1;

        // finalizer 全部移除后，处于删除流程的对象真正被删除
        let finalized = updated.metadata.deletion_timestamp.is_some()
            && updated
                .metadata
                .finalizers
                .as_ref()
                .map(|f| f.is_empty())
                .unwrap_or(true);
        if finalized {
            state.remove_cascading(&key);
        }

        Ok(updated)
    }

    async fn update_status(&self, kind: ObjectKind, obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.write().await;
        let key = ObjectKey::of(kind, &obj)?;
        state.check_version(&key, &obj)?;
        if state.take_conflict() {
            return Err(Error::conflict(kind.as_str(), key.namespace(), &key.name));
        }

        let version = state.bump_version();
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(kind.as_str(), key.namespace(), &key.name))?;

        if !stored.data.is_object() {
            stored.data = json!({});
        }
        match obj.data.get("status") {
            Some(status) => stored.data["status"] = status.clone(),
            None => {
                if let Some(data) = stored.data.as_object_mut() {
                    data.remove("status");
                }
            }
        }
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.writes += 1;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn object(name: &str, namespace: Option<&str>, data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            },
            data,
        }
    }

    #[tokio::test]
    async fn test_create_get_and_already_exists() {
        let cluster = MemoryCluster::new();
        let created = cluster
            .create(ObjectKind::Addon, object("dashboard", None, json!({"spec": {}})))
            .await
            .unwrap();
        assert!(created.metadata.uid.is_some());

        let err = cluster
            .create(ObjectKind::Addon, object("dashboard", None, json!({"spec": {}})))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        let err = cluster.get(ObjectKind::Addon, None, "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let cluster = MemoryCluster::new();
        let created = cluster
            .create(ObjectKind::Addon, object("dashboard", None, json!({"spec": {}})))
            .await
            .unwrap();

        let mut first = created.clone();
        first.data["spec"]["version"] = json!("v0.1.1");
        cluster.update(ObjectKind::Addon, first).await.unwrap();

        let mut stale = created;
        stale.data["spec"]["version"] = json!("v0.2.0");
        let err = cluster.update(ObjectKind::Addon, stale).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_does_not_touch_status() {
        let cluster = MemoryCluster::new();
        let created = cluster
            .create(ObjectKind::Addon, object("dashboard", None, json!({"spec": {}})))
            .await
            .unwrap();

        let mut with_status = created;
        with_status.data["status"] = json!({"version": "v0.2.0"});
        let after_status = cluster
            .update_status(ObjectKind::Addon, with_status)
            .await
            .unwrap();

        let mut main = after_status;
        main.data["status"] = json!({"version": "bogus"});
        let updated = cluster.update(ObjectKind::Addon, main).await.unwrap();
        assert_eq!(updated.data["status"]["version"], "v0.2.0");
    }

    #[tokio::test]
    async fn test_finalizer_blocks_deletion() {
        let cluster = MemoryCluster::new();
        let mut obj = object("cluster", None, json!({"spec": {}}));
        obj.metadata.finalizers = Some(vec!["operator.tekton.dev/finalizer".into()]);
        cluster.create(ObjectKind::Config, obj).await.unwrap();

        cluster.delete(ObjectKind::Config, None, "cluster").await.unwrap();
        let pending = cluster.get(ObjectKind::Config, None, "cluster").await.unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        let mut released = pending;
        released.metadata.finalizers = Some(vec![]);
        cluster.update(ObjectKind::Config, released).await.unwrap();
        assert!(!cluster.contains(ObjectKind::Config, None, "cluster").await);
    }

    #[tokio::test]
    async fn test_owner_garbage_collection() {
        let cluster = MemoryCluster::with_auto_ready();
        let owner = cluster
            .create(ObjectKind::Addon, object("dashboard", None, json!({"spec": {}})))
            .await
            .unwrap();

        let mut child = object(
            "tekton-dashboard",
            Some("tekton-pipelines"),
            json!({"spec": {"replicas": 1}}),
        );
        child.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "operator.tekton.dev/v1alpha1".into(),
            kind: "Addon".into(),
            name: "dashboard".into(),
            uid: owner.metadata.uid.clone().unwrap(),
            ..Default::default()
        }]);
        let child = cluster.create(ObjectKind::Deployment, child).await.unwrap();
        assert_eq!(child.data["status"]["readyReplicas"], 1);

        cluster.delete(ObjectKind::Addon, None, "dashboard").await.unwrap();
        assert!(
            !cluster
                .contains(ObjectKind::Deployment, Some("tekton-pipelines"), "tekton-dashboard")
                .await
        );
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let cluster = MemoryCluster::new();
        let mut labelled = object("a", Some("ns1"), json!({"spec": {}}));
        labelled.metadata.labels = Some([("app".to_string(), "x".to_string())].into());
        cluster.create(ObjectKind::Deployment, labelled).await.unwrap();
        cluster
            .create(ObjectKind::Deployment, object("b", Some("ns2"), json!({"spec": {}})))
            .await
            .unwrap();

        let all = cluster.list(ObjectKind::Deployment, None, &Labels::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let ns1 = cluster
            .list(ObjectKind::Deployment, Some("ns1"), &Labels::new())
            .await
            .unwrap();
        assert_eq!(ns1.len(), 1);

        let selector: Labels = [("app".to_string(), "x".to_string())].into();
        let selected = cluster.list(ObjectKind::Deployment, None, &selector).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.name.as_deref(), Some("a"));
    }
}
