//! 自定义资源定义模块
//!
//! 该模块定义了 Tekton Operator 的两种自定义资源：集群单例 `Config`
//! 声明基础平台（Tekton Pipelines）的安装目标，`Addon` 声明一个可选插件及其版本。
//! 两者均为集群级资源。

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tekton_common::{current_state, Condition, InstallState};

/// API 组
pub const API_GROUP: &str = "operator.tekton.dev";

/// 单例 Config 资源的固定名称
pub const CLUSTER_CONFIG_NAME: &str = "cluster";

/// 默认的目标命名空间
pub const DEFAULT_TARGET_NAMESPACE: &str = "tekton-pipelines";

/// 基础平台配置规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "operator.tekton.dev", version = "v1alpha1", kind = "Config")]
#[kube(status = "ConfigStatus")]
#[kube(printcolumn = r#"{"name":"Namespace", "type":"string", "jsonPath":".spec.targetNamespace"}"#)]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[0].code"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    /// 基础平台安装到的命名空间，安装完成后不可修改
    #[serde(default = "default_target_namespace")]
    pub target_namespace: String,
}

/// 基础平台状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStatus {
    /// 状态条件，第一个为当前状态
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// 实际安装到的命名空间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// 最近一次完成协调的 generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// 插件规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "operator.tekton.dev", version = "v1alpha1", kind = "Addon")]
#[kube(status = "AddonStatus")]
#[kube(printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version"}"#)]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[0].code"}"#)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    /// 请求的版本，为空表示最新版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// 插件状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonStatus {
    /// 状态条件，第一个为当前状态
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// 已解析并安装的版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// 插件安装到的命名空间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// 最近一次完成协调的 generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// 默认目标命名空间
fn default_target_namespace() -> String {
    DEFAULT_TARGET_NAMESPACE.to_string()
}

impl Config {
    /// 当前安装状态
    pub fn install_state(&self) -> InstallState {
        self.status
            .as_ref()
            .map(|s| current_state(&s.conditions))
            .unwrap_or(InstallState::Absent)
    }

    /// 已安装的命名空间；尚未安装完成时使用规范中的值
    pub fn installed_namespace(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.target_namespace.as_deref())
            .unwrap_or(&self.spec.target_namespace)
    }

    /// 是否已处于删除流程
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

impl Addon {
    /// 当前安装状态
    pub fn install_state(&self) -> InstallState {
        self.status
            .as_ref()
            .map(|s| current_state(&s.conditions))
            .unwrap_or(InstallState::Absent)
    }

    /// 请求的版本，空字符串视为未指定
    pub fn requested_version(&self) -> Option<&str> {
        self.spec
            .version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// 已安装的版本
    pub fn installed_version(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.version.as_deref())
    }

    /// 期望状态是否与已安装状态不一致
    ///
    /// 规范被修改（`metadata.generation` 超过 `status.observedGeneration`）时视为变化，
    /// 包括取消版本固定。仅发布目录新增版本不会触发重新解析。
    pub fn spec_changed(&self, target_namespace: &str) -> bool {
        let status = match &self.status {
            Some(status) => status,
            None => return true,
        };

        if status.version.is_none()
            || status.target_namespace.as_deref() != Some(target_namespace)
            || self.metadata.generation != status.observed_generation
        {
            return true;
        }

        match self.requested_version() {
            Some(requested) => status.version.as_deref() != Some(requested),
            None => false,
        }
    }

    /// 是否已处于删除流程
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
