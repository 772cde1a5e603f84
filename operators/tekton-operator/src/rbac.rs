//! 命名空间权限模块
//!
//! 基础平台安装完成后，为每个用户命名空间创建运行流水线所需的 `pipeline`
//! 服务账号，以及把 `edit` 集群角色授予该账号的角色绑定。

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::DynamicObject;
use tekton_common::Result;
use tracing::debug;

use crate::cluster::{to_dynamic, ClusterState, Labels, ObjectKind, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::manifests::{COMPONENT_LABEL, PART_OF_LABEL};

/// 流水线服务账号名称
pub const PIPELINE_SERVICE_ACCOUNT: &str = "pipeline";

/// 流水线角色绑定名称
pub const PIPELINE_ROLE_BINDING: &str = "pipeline-edit";

/// 授予流水线服务账号的集群角色
pub const PIPELINE_CLUSTER_ROLE: &str = "edit";

const RBAC_COMPONENT: &str = "rbac";

const SYSTEM_NAMESPACE_PREFIXES: [&str; 2] = ["kube-", "openshift-"];

/// 是否为系统命名空间
pub fn is_system_namespace(name: &str) -> bool {
    SYSTEM_NAMESPACE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn metadata(name: &str, namespace: &str, owner: &OwnerReference) -> ObjectMeta {
    let mut labels = Labels::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(PART_OF_LABEL.to_string(), "tekton".to_string());
    labels.insert(COMPONENT_LABEL.to_string(), RBAC_COMPONENT.to_string());

    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

/// 命名空间中需要的权限对象
pub fn namespace_rbac(namespace: &str, owner: &OwnerReference) -> Result<Vec<(ObjectKind, DynamicObject)>> {
    let service_account = ServiceAccount {
        metadata: metadata(PIPELINE_SERVICE_ACCOUNT, namespace, owner),
        ..Default::default()
    };

    let role_binding = RoleBinding {
        metadata: metadata(PIPELINE_ROLE_BINDING, namespace, owner),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "ClusterRole".into(),
            name: PIPELINE_CLUSTER_ROLE.into(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: PIPELINE_SERVICE_ACCOUNT.into(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    };

    Ok(vec![
        (ObjectKind::ServiceAccount, to_dynamic(&service_account)?),
        (ObjectKind::RoleBinding, to_dynamic(&role_binding)?),
    ])
}

/// 确保命名空间中存在流水线权限对象
///
/// 返回新创建的对象数量，已存在的对象保持不变。
pub async fn ensure_namespace_rbac(
    client: &dyn ClusterState,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<usize> {
    let mut created = 0;
    for (kind, object) in namespace_rbac(namespace, owner)? {
        match client.create(kind, object).await {
            Ok(_) => {
                debug!(kind = %kind, namespace = %namespace, "已创建流水线权限对象");
                created += 1;
            }
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use rstest::rstest;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "operator.tekton.dev/v1alpha1".into(),
            kind: "Config".into(),
            name: "cluster".into(),
            uid: "uid-cluster".into(),
            controller: Some(true),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("kube-system", true)]
    #[case("kube-public", true)]
    #[case("openshift-monitoring", true)]
    #[case("default", false)]
    #[case("team-a", false)]
    fn test_system_namespaces(#[case] name: &str, #[case] system: bool) {
        assert_eq!(is_system_namespace(name), system);
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let cluster = MemoryCluster::new();
        assert_eq!(ensure_namespace_rbac(&cluster, "team-a", &owner()).await.unwrap(), 2);
        assert_eq!(ensure_namespace_rbac(&cluster, "team-a", &owner()).await.unwrap(), 0);

        let binding = cluster
            .get(ObjectKind::RoleBinding, Some("team-a"), PIPELINE_ROLE_BINDING)
            .await
            .unwrap();
        assert_eq!(binding.data["roleRef"]["name"], PIPELINE_CLUSTER_ROLE);
        assert_eq!(binding.data["subjects"][0]["namespace"], "team-a");
        assert_eq!(binding.metadata.owner_references.unwrap()[0].uid, "uid-cluster");
    }
}
