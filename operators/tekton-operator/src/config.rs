//! 配置管理模块
//!
//! 该模块负责加载 Operator 的运行配置。配置按以下顺序叠加：内置默认值、
//! 可选的 YAML/JSON 配置文件、以 `TEKTON_OPERATOR__` 为前缀的环境变量。

use anyhow::{anyhow, bail, Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::crd::DEFAULT_TARGET_NAMESPACE;
use crate::reconcile::{ReconcileSettings, DEFAULT_PIPELINE_VERSION};
use crate::version::StaticCatalog;
use crate::waiter::PollPolicy;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "TEKTON_OPERATOR";

/// Operator 配置结构
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OperatorConfig {
    /// 默认目标命名空间
    pub default_target_namespace: String,
    /// 基础平台版本
    pub pipeline_version: String,
    /// 安装就绪超时（秒）
    pub install_timeout_secs: u64,
    /// 初始轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 最大轮询间隔（毫秒）
    pub max_poll_interval_ms: u64,
    /// 轮询间隔增长倍数
    pub poll_backoff_multiplier: f64,
    /// 已收敛资源的重新检查周期（秒）
    pub resync_interval_secs: u64,
    /// 等待依赖时的重新排队间隔（秒）
    pub dependency_requeue_secs: u64,
    /// 失败重试基础间隔（秒）
    pub error_requeue_secs: u64,
    /// 失败重试最大间隔（秒）
    pub max_error_requeue_secs: u64,
    /// 日志级别
    pub log_level: String,
    /// 插件发布目录：插件名到已发布版本列表
    pub catalog: BTreeMap<String, Vec<String>>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        let mut catalog = BTreeMap::new();
        catalog.insert(
            "dashboard".to_string(),
            vec!["v0.1.1".to_string(), "v0.2.0".to_string()],
        );
        catalog.insert(
            "triggers".to_string(),
            vec!["v0.1.0".to_string(), "v0.2.1".to_string(), "v0.3.1".to_string()],
        );

        Self {
            default_target_namespace: DEFAULT_TARGET_NAMESPACE.to_string(),
            pipeline_version: DEFAULT_PIPELINE_VERSION.to_string(),
            install_timeout_secs: 300,
            poll_interval_ms: 1000,
            max_poll_interval_ms: 5000,
            poll_backoff_multiplier: 1.5,
            resync_interval_secs: 300,
            dependency_requeue_secs: 10,
            error_requeue_secs: 30,
            max_error_requeue_secs: 600,
            log_level: "info".to_string(),
            catalog,
        }
    }
}

impl OperatorConfig {
    /// 加载配置，`path` 为空时只使用默认值与环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: Option<&Path>, environment: Environment) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            let file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => bail!("不支持的配置文件格式，仅支持 YAML 或 JSON"),
            };
            builder = builder.add_source(File::with_name(file).format(format));
        }

        let config = builder
            .add_source(environment.separator("__").try_parsing(true))
            .build()
            .context("构建配置失败")?;

        let operator_config = config
            .try_deserialize::<OperatorConfig>()
            .context("配置格式错误")?;
        operator_config.validate()?;

        debug!(config = ?operator_config, "已加载配置");
        Ok(operator_config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.default_target_namespace.trim().is_empty() {
            bail!("default_target_namespace 不能为空");
        }
        if self.pipeline_version.trim().is_empty() {
            bail!("pipeline_version 不能为空");
        }
        if self.install_timeout_secs == 0 || self.poll_interval_ms == 0 {
            bail!("install_timeout_secs 与 poll_interval_ms 必须大于 0");
        }
        if self.resync_interval_secs == 0
            || self.dependency_requeue_secs == 0
            || self.error_requeue_secs == 0
        {
            bail!("重新排队间隔必须大于 0");
        }
        if self.max_poll_interval_ms < self.poll_interval_ms {
            bail!("max_poll_interval_ms 不能小于 poll_interval_ms");
        }
        if self.max_error_requeue_secs < self.error_requeue_secs {
            bail!("max_error_requeue_secs 不能小于 error_requeue_secs");
        }
        if self.poll_backoff_multiplier.is_nan() || self.poll_backoff_multiplier < 1.0 {
            bail!("poll_backoff_multiplier 不能小于 1.0");
        }
        self.catalog()?;
        Ok(())
    }

    /// 轮询策略
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            timeout: Duration::from_secs(self.install_timeout_secs),
            interval: Duration::from_millis(self.poll_interval_ms),
            max_interval: Duration::from_millis(self.max_poll_interval_ms),
            multiplier: self.poll_backoff_multiplier,
        }
    }

    /// 协调参数
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            default_target_namespace: self.default_target_namespace.clone(),
            pipeline_version: self.pipeline_version.clone(),
            poll: self.poll_policy(),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            dependency_requeue: Duration::from_secs(self.dependency_requeue_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            max_error_requeue: Duration::from_secs(self.max_error_requeue_secs),
        }
    }

    /// 插件发布目录
    pub fn catalog(&self) -> Result<StaticCatalog> {
        StaticCatalog::new(self.catalog.clone()).context("插件发布目录无效")
    }
}
