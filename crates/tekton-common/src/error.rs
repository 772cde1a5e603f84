//! 错误处理模块
//!
//! 该模块提供 Tekton Operator 的统一错误处理机制。错误类型本身携带分类信息：
//! 是否可以通过重新排队重试、是否需要以 `Error` 状态条件的形式呈现给用户。

use std::time::Duration;
use thiserror::Error;

/// Tekton Operator 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 请求的插件版本未发布
    #[error("插件 {addon} 不存在版本 {version}")]
    VersionNotFound { addon: String, version: String },

    /// 插件没有任何已发布版本
    #[error("插件 {0} 没有可用的已发布版本")]
    NoVersionsAvailable(String),

    /// 资源不存在
    #[error("资源不存在: {kind} {}", qualified(.namespace, .name))]
    NotFound {
        kind: String,
        namespace: Option<String>,
        name: String,
    },

    /// 资源已存在
    #[error("资源已存在: {kind} {}", qualified(.namespace, .name))]
    AlreadyExists {
        kind: String,
        namespace: Option<String>,
        name: String,
    },

    /// 资源版本过期，写入冲突
    #[error("资源写入冲突: {kind} {}", qualified(.namespace, .name))]
    Conflict {
        kind: String,
        namespace: Option<String>,
        name: String,
    },

    /// 等待超时
    #[error("等待超时: {0}")]
    Timeout(String),

    /// 仍有插件依赖基础平台
    #[error("仍有插件依赖基础平台，无法删除: {}", .0.join(", "))]
    DependentsStillInstalled(Vec<String>),

    /// 安装器执行失败
    #[error("安装器执行失败: {0}")]
    InstallerFailure(String),

    /// 资源声明不合法
    #[error("资源声明不合法: {0}")]
    InvalidSpec(String),

    /// 集群 API 暂时不可用
    #[error("集群 API 错误: {0}")]
    Transient(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tekton Operator 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

fn qualified(namespace: &Option<String>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

impl Error {
    /// 构造 NotFound 错误
    pub fn not_found(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// 构造 AlreadyExists 错误
    pub fn already_exists(
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Error::AlreadyExists {
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// 构造 Conflict 错误
    pub fn conflict(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Error::Conflict {
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// 是否为 NotFound
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// 是否为 AlreadyExists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// 是否可以通过重新排队重试
    ///
    /// 冲突与暂时性 API 错误静默重试；超时与安装失败在写入 `Error`
    /// 状态后同样重试。版本与依赖类错误需要外部条件变化才能恢复，
    /// 但仍按退避周期重新检查。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::Transient(_)
                | Error::Timeout(_)
                | Error::InstallerFailure(_)
                | Error::NotFound { .. }
                | Error::AlreadyExists { .. }
        )
    }

    /// 是否需要写入资源的 `Error` 状态条件
    pub fn surfaces_as_condition(&self) -> bool {
        matches!(
            self,
            Error::VersionNotFound { .. }
                | Error::NoVersionsAvailable(_)
                | Error::DependentsStillInstalled(_)
                | Error::Timeout(_)
                | Error::InstallerFailure(_)
                | Error::InvalidSpec(_)
        )
    }

    /// 状态条件中使用的机器可读原因
    pub fn reason(&self) -> &'static str {
        match self {
            Error::VersionNotFound { .. } => "VersionNotFound",
            Error::NoVersionsAvailable(_) => "NoVersionsAvailable",
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::Conflict { .. } => "Conflict",
            Error::Timeout(_) => "Timeout",
            Error::DependentsStillInstalled(_) => "DependentsStillInstalled",
            Error::InstallerFailure(_) => "InstallerFailure",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::Transient(_) => "Transient",
            Error::Config(_) => "Config",
            Error::Json(_) => "Serialization",
        }
    }

    /// 基于重试次数的指数退避延迟
    ///
    /// base → 2·base → 4·base …，不超过 max。
    pub fn backoff_delay(retries: u32, base: Duration, max: Duration) -> Duration {
        let exponent = retries.saturating_sub(1).min(16);
        base.saturating_mul(2u32.saturating_pow(exponent)).min(max)
    }
}
