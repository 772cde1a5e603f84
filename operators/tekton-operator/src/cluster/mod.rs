//! 集群状态客户端模块
//!
//! 该模块定义了协调引擎访问集群的唯一入口 `ClusterState`。所有对集群对象的
//! 读写都经过该接口，对象统一以 `DynamicObject` 表示并以 `ObjectKind` 标注类型，
//! 具体实现包括基于 kube-rs 的 `KubeClusterState` 与用于测试的 `MemoryCluster`。

mod kubernetes;
#[cfg(test)]
mod memory;

pub use self::kubernetes::KubeClusterState;
#[cfg(test)]
pub use self::memory::MemoryCluster;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{ApiResource, DynamicObject};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tekton_common::{Error, Result};

use crate::crd::{Addon, Config};

/// 由 Operator 管理的对象标签
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// 管理者标签值
pub const MANAGED_BY_VALUE: &str = "tekton-operator";

/// 标签选择器（仅支持等值匹配）
pub type Labels = BTreeMap<String, String>;

/// 集群对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Config,
    Addon,
    Namespace,
    Deployment,
    ServiceAccount,
    ClusterRoleBinding,
    RoleBinding,
    ValidatingWebhookConfiguration,
    MutatingWebhookConfiguration,
}

impl ObjectKind {
    /// 安装器可能创建的对象类型
    pub const INSTALLABLE: [ObjectKind; 6] = [
        ObjectKind::Deployment,
        ObjectKind::ServiceAccount,
        ObjectKind::ClusterRoleBinding,
        ObjectKind::RoleBinding,
        ObjectKind::ValidatingWebhookConfiguration,
        ObjectKind::MutatingWebhookConfiguration,
    ];

    /// 对应的 API 资源描述
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ObjectKind::Config => ApiResource::erase::<Config>(&()),
            ObjectKind::Addon => ApiResource::erase::<Addon>(&()),
            ObjectKind::Namespace => ApiResource::erase::<Namespace>(&()),
            ObjectKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ObjectKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            ObjectKind::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
            ObjectKind::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
            ObjectKind::ValidatingWebhookConfiguration => {
                ApiResource::erase::<ValidatingWebhookConfiguration>(&())
            }
            ObjectKind::MutatingWebhookConfiguration => {
                ApiResource::erase::<MutatingWebhookConfiguration>(&())
            }
        }
    }

    /// 是否为命名空间级资源
    pub fn is_namespaced(&self) -> bool {
        matches!(
            self,
            ObjectKind::Deployment | ObjectKind::ServiceAccount | ObjectKind::RoleBinding
        )
    }

    /// 资源类型名
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Config => "Config",
            ObjectKind::Addon => "Addon",
            ObjectKind::Namespace => "Namespace",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::ClusterRoleBinding => "ClusterRoleBinding",
            ObjectKind::RoleBinding => "RoleBinding",
            ObjectKind::ValidatingWebhookConfiguration => "ValidatingWebhookConfiguration",
            ObjectKind::MutatingWebhookConfiguration => "MutatingWebhookConfiguration",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 集群对象的唯一标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// 创建对象标识，集群级资源忽略命名空间
    pub fn new(kind: ObjectKind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: if kind.is_namespaced() {
                namespace.map(str::to_string)
            } else {
                None
            },
            name: name.into(),
        }
    }

    /// 从动态对象中提取标识
    pub fn of(kind: ObjectKind, obj: &DynamicObject) -> Result<Self> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::InvalidSpec(format!("{} 缺少 metadata.name", kind)))?;
        Ok(Self::new(kind, obj.metadata.namespace.as_deref(), name))
    }

    /// 命名空间的借用形式
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// 集群状态客户端
///
/// 删除不保证幂等：对不存在的对象调用 `delete` 返回 `NotFound`，
/// 调用方需要自行处理。
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// 创建对象，同名对象已存在时返回 `AlreadyExists`
    async fn create(&self, kind: ObjectKind, obj: DynamicObject) -> Result<DynamicObject>;

    /// 获取对象，不存在时返回 `NotFound`
    async fn get(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Result<DynamicObject>;

    /// 删除对象，不存在时返回 `NotFound`
    async fn delete(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Result<()>;

    /// 列出对象，`namespace` 为 `None` 时跨所有命名空间
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        selector: &Labels,
    ) -> Result<Vec<DynamicObject>>;

    /// 更新对象（不含状态），资源版本过期时返回 `Conflict`
    async fn update(&self, kind: ObjectKind, obj: DynamicObject) -> Result<DynamicObject>;

    /// 更新状态子资源，资源版本过期时返回 `Conflict`
    async fn update_status(&self, kind: ObjectKind, obj: DynamicObject) -> Result<DynamicObject>;
}

/// 共享的集群客户端句柄
pub type SharedClusterState = Arc<dyn ClusterState>;

/// 将强类型对象转换为动态对象
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// 将动态对象转换为强类型对象
pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// 获取对象，不存在时返回 `None`
pub async fn get_opt(
    client: &dyn ClusterState,
    kind: ObjectKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<DynamicObject>> {
    match client.get(kind, namespace, name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// 获取并解析强类型对象，不存在时返回 `None`
pub async fn fetch<K: DeserializeOwned>(
    client: &dyn ClusterState,
    kind: ObjectKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>> {
    match get_opt(client, kind, namespace, name).await? {
        Some(obj) => Ok(Some(from_dynamic(obj)?)),
        None => Ok(None),
    }
}

/// 删除对象，不存在视为成功
pub async fn delete_if_exists(
    client: &dyn ClusterState,
    kind: ObjectKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<bool> {
    match client.delete(kind, namespace, name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// 为自定义资源构造指向自身的所有者引用
pub fn owner_reference<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::InvalidSpec(format!(
            "{} {} 缺少 uid，无法作为所有者",
            K::kind(&()),
            owner.meta().name.as_deref().unwrap_or("<unknown>")
        ))
    })
}

/// 对象是否由指定 UID 的资源拥有
pub fn is_owned_by(obj: &DynamicObject, owner_uid: &str) -> bool {
    obj.metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == owner_uid))
        .unwrap_or(false)
}

/// 查询所有者为指定 UID 的 Operator 托管对象
///
/// 所有权是子对象上的反向引用，通过元数据查询得到，资源本身不持有子对象列表。
pub async fn owned_objects(client: &dyn ClusterState, owner_uid: &str) -> Result<Vec<ObjectKey>> {
    let mut selector = Labels::new();
    selector.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    let mut owned = Vec::new();
    for kind in ObjectKind::INSTALLABLE {
        for obj in client.list(kind, None, &selector).await? {
            if is_owned_by(&obj, owner_uid) {
                owned.push(ObjectKey::of(kind, &obj)?);
            }
        }
    }

    owned.sort();
    Ok(owned)
}

/// 标签是否满足等值选择器
pub fn matches_labels(obj: &DynamicObject, selector: &Labels) -> bool {
    let labels = obj.metadata.labels.as_ref();
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// 把选择器格式化为 `k=v,k2=v2`
pub fn selector_string(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
