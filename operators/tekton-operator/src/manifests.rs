//! 组件清单模块
//!
//! 每个组件（基础平台与各插件）对应一组固定的集群对象。该模块用强类型的
//! k8s-openapi 结构构建这些对象，并给出安装后需要等待就绪的对象列表。

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, ServiceReference, ValidatingWebhook,
    ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::core::DynamicObject;
use std::fmt;
use tekton_common::Result;

use crate::cluster::{to_dynamic, Labels, ObjectKind, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::waiter::ComponentRef;

/// 组件标签
pub const COMPONENT_LABEL: &str = "operator.tekton.dev/component";

/// 版本标签
pub const VERSION_LABEL: &str = "operator.tekton.dev/version";

/// 所属项目标签
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// 基础平台组件名
pub const PIPELINE_COMPONENT: &str = "pipeline";

/// 基础平台控制器 Deployment 名称
pub const PIPELINE_CONTROLLER_NAME: &str = "tekton-pipelines-controller";

/// 基础平台 webhook Deployment 名称
pub const PIPELINE_WEBHOOK_NAME: &str = "tekton-pipelines-webhook";

const IMAGE_REGISTRY: &str = "gcr.io/tekton-releases/github.com/tektoncd";

/// 可安装的组件
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Component {
    /// 基础平台
    Pipeline,
    /// 命名插件
    Addon(String),
}

impl Component {
    /// 插件组件
    pub fn addon(name: impl Into<String>) -> Self {
        Component::Addon(name.into())
    }

    /// 组件名
    pub fn name(&self) -> &str {
        match self {
            Component::Pipeline => PIPELINE_COMPONENT,
            Component::Addon(name) => name,
        }
    }

    /// 选择该组件全部对象的标签
    pub fn selector(&self) -> Labels {
        let mut labels = Labels::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(COMPONENT_LABEL.to_string(), self.name().to_string());
        labels
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 已渲染的清单对象
#[derive(Debug, Clone)]
pub struct ManifestObject {
    pub kind: ObjectKind,
    pub object: DynamicObject,
}

/// 组件的组成部分
enum Part {
    ServiceAccount {
        name: String,
    },
    Deployment {
        name: String,
        image: String,
        service_account: String,
    },
    ClusterAdminBinding {
        name: String,
        service_account: String,
    },
    ValidatingWebhook {
        name: String,
        service: String,
    },
    MutatingWebhook {
        name: String,
        service: String,
    },
}

fn parts(component: &Component) -> Vec<Part> {
    match component {
        Component::Pipeline => vec![
            Part::ServiceAccount {
                name: PIPELINE_CONTROLLER_NAME.into(),
            },
            Part::ClusterAdminBinding {
                name: format!("{}-admin", PIPELINE_CONTROLLER_NAME),
                service_account: PIPELINE_CONTROLLER_NAME.into(),
            },
            Part::Deployment {
                name: PIPELINE_CONTROLLER_NAME.into(),
                image: format!("{}/pipeline/cmd/controller", IMAGE_REGISTRY),
                service_account: PIPELINE_CONTROLLER_NAME.into(),
            },
            Part::Deployment {
                name: PIPELINE_WEBHOOK_NAME.into(),
                image: format!("{}/pipeline/cmd/webhook", IMAGE_REGISTRY),
                service_account: PIPELINE_CONTROLLER_NAME.into(),
            },
            Part::ValidatingWebhook {
                name: "validation.webhook.pipeline.tekton.dev".into(),
                service: PIPELINE_WEBHOOK_NAME.into(),
            },
            Part::MutatingWebhook {
                name: "webhook.pipeline.tekton.dev".into(),
                service: PIPELINE_WEBHOOK_NAME.into(),
            },
        ],
        Component::Addon(name) if name == "dashboard" => vec![
            Part::ServiceAccount {
                name: "tekton-dashboard".into(),
            },
            Part::Deployment {
                name: "tekton-dashboard".into(),
                image: format!("{}/dashboard/cmd/dashboard", IMAGE_REGISTRY),
                service_account: "tekton-dashboard".into(),
            },
        ],
        Component::Addon(name) if name == "triggers" => vec![
            Part::ServiceAccount {
                name: "tekton-triggers-controller".into(),
            },
            Part::Deployment {
                name: "tekton-triggers-controller".into(),
                image: format!("{}/triggers/cmd/controller", IMAGE_REGISTRY),
                service_account: "tekton-triggers-controller".into(),
            },
            Part::Deployment {
                name: "tekton-triggers-webhook".into(),
                image: format!("{}/triggers/cmd/webhook", IMAGE_REGISTRY),
                service_account: "tekton-triggers-controller".into(),
            },
        ],
        Component::Addon(name) => vec![Part::Deployment {
            name: format!("tekton-{}", name),
            image: format!("{}/{}/cmd/{}", IMAGE_REGISTRY, name, name),
            service_account: "default".into(),
        }],
    }
}

/// 渲染组件在目标命名空间中的全部对象
///
/// 对象不带所有者引用，由安装器在写入前补上。
pub fn render(component: &Component, namespace: &str, version: &str) -> Result<Vec<ManifestObject>> {
    let mut labels = component.selector();
    labels.insert(PART_OF_LABEL.to_string(), "tekton".to_string());
    labels.insert(VERSION_LABEL.to_string(), version.to_string());

    let meta = |name: &str, namespaced: bool| ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespaced.then(|| namespace.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    };

    let mut objects = Vec::new();
    for part in parts(component) {
        let (kind, object) = match part {
            Part::ServiceAccount { name } => (
                ObjectKind::ServiceAccount,
                to_dynamic(&ServiceAccount {
                    metadata: meta(&name, true),
                    ..Default::default()
                })?,
            ),
            Part::Deployment {
                name,
                image,
                service_account,
            } => (
                ObjectKind::Deployment,
                to_dynamic(&deployment(meta(&name, true), &name, &image, version, &service_account))?,
            ),
            Part::ClusterAdminBinding {
                name,
                service_account,
            } => (
                ObjectKind::ClusterRoleBinding,
                to_dynamic(&ClusterRoleBinding {
                    metadata: meta(&name, false),
                    role_ref: RoleRef {
                        api_group: "rbac.authorization.k8s.io".into(),
                        kind: "ClusterRole".into(),
                        name: "cluster-admin".into(),
                    },
                    subjects: Some(vec![Subject {
                        kind: "ServiceAccount".into(),
                        name: service_account,
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    }]),
                })?,
            ),
            Part::ValidatingWebhook { name, service } => (
                ObjectKind::ValidatingWebhookConfiguration,
                to_dynamic(&ValidatingWebhookConfiguration {
                    metadata: meta(&name, false),
                    webhooks: Some(vec![ValidatingWebhook {
                        name: name.clone(),
                        admission_review_versions: vec!["v1".into()],
                        client_config: client_config(namespace, &service),
                        side_effects: "None".into(),
                        failure_policy: Some("Fail".into()),
                        ..Default::default()
                    }]),
                })?,
            ),
            Part::MutatingWebhook { name, service } => (
                ObjectKind::MutatingWebhookConfiguration,
                to_dynamic(&MutatingWebhookConfiguration {
                    metadata: meta(&name, false),
                    webhooks: Some(vec![MutatingWebhook {
                        name: name.clone(),
                        admission_review_versions: vec!["v1".into()],
                        client_config: client_config(namespace, &service),
                        side_effects: "None".into(),
                        failure_policy: Some("Fail".into()),
                        ..Default::default()
                    }]),
                })?,
            ),
        };
        objects.push(ManifestObject { kind, object });
    }

    Ok(objects)
}

/// 安装后需要等待就绪的对象
pub fn readiness_targets(component: &Component, namespace: &str) -> Vec<ComponentRef> {
    parts(component)
        .into_iter()
        .filter_map(|part| match part {
            Part::Deployment { name, .. } => Some(ComponentRef::deployment(namespace, name, 1)),
            Part::ValidatingWebhook { name, .. } => {
                Some(ComponentRef::exists(ObjectKind::ValidatingWebhookConfiguration, None, name))
            }
            Part::MutatingWebhook { name, .. } => {
                Some(ComponentRef::exists(ObjectKind::MutatingWebhookConfiguration, None, name))
            }
            Part::ServiceAccount { .. } | Part::ClusterAdminBinding { .. } => None,
        })
        .collect()
}

fn deployment(
    metadata: ObjectMeta,
    name: &str,
    image: &str,
    version: &str,
    service_account: &str,
) -> Deployment {
    let mut pod_labels = Labels::new();
    pod_labels.insert("app".to_string(), name.to_string());

    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account.to_string()),
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(format!("{}:{}", image, version)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn client_config(namespace: &str, service: &str) -> WebhookClientConfig {
    WebhookClientConfig {
        service: Some(ServiceReference {
            name: service.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_manifests() {
        let objects = render(&Component::Pipeline, "tekton-pipelines", "v0.10.1").unwrap();
        let kinds: Vec<ObjectKind> = objects.iter().map(|o| o.kind).collect();
        assert_eq!(kinds.iter().filter(|k| **k == ObjectKind::Deployment).count(), 2);
        assert!(kinds.contains(&ObjectKind::ValidatingWebhookConfiguration));
        assert!(kinds.contains(&ObjectKind::MutatingWebhookConfiguration));

        let controller = objects
            .iter()
            .find(|o| o.object.metadata.name.as_deref() == Some(PIPELINE_CONTROLLER_NAME)
                && o.kind == ObjectKind::Deployment)
            .unwrap();
        assert_eq!(controller.object.metadata.namespace.as_deref(), Some("tekton-pipelines"));
        assert_eq!(
            controller.object.data["spec"]["template"]["spec"]["containers"][0]["image"],
            "gcr.io/tekton-releases/github.com/tektoncd/pipeline/cmd/controller:v0.10.1"
        );

        // 集群级对象不带命名空间
        let webhook = objects
            .iter()
            .find(|o| o.kind == ObjectKind::ValidatingWebhookConfiguration)
            .unwrap();
        assert_eq!(webhook.object.metadata.namespace, None);
    }

    #[test]
    fn test_objects_carry_component_labels() {
        let objects = render(&Component::addon("dashboard"), "tekton-pipelines", "v0.2.0").unwrap();
        for object in &objects {
            let labels = object.object.metadata.labels.as_ref().unwrap();
            assert_eq!(labels[COMPONENT_LABEL], "dashboard");
            assert_eq!(labels[VERSION_LABEL], "v0.2.0");
            assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        }
    }

    #[test]
    fn test_readiness_targets() {
        let targets = readiness_targets(&Component::addon("dashboard"), "tekton-pipelines");
        assert_eq!(targets, vec![ComponentRef::deployment("tekton-pipelines", "tekton-dashboard", 1)]);

        let targets = readiness_targets(&Component::Pipeline, "tekton-pipelines");
        assert_eq!(targets.len(), 4);

        let targets = readiness_targets(&Component::addon("chains"), "ns");
        assert_eq!(targets, vec![ComponentRef::deployment("ns", "tekton-chains", 1)]);
    }
}
