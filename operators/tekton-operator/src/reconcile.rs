//! 资源协调模块
//!
//! 该模块负责协调 Tekton Operator 自定义资源的状态，确保实际状态与期望状态一致。
//! `Config` 驱动基础平台的安装与卸载，`Addon` 在基础平台就绪后安装插件，
//! 命名空间协调为用户命名空间补齐流水线权限。
//!
//! 协调器不缓存任何集群对象：每次调用都重新读取资源及其依赖。同一资源的
//! 协调由 kube-rs 运行时串行执行，协调器只保存计数与每个资源的失败次数。

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tekton_common::{push_condition, Condition, Error, InstallState, InstallStatus, Result};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{
    delete_if_exists, fetch, from_dynamic, get_opt, owned_objects, owner_reference, to_dynamic,
    Labels, ObjectKind, SharedClusterState,
};
use crate::crd::{
    Addon, AddonStatus, Config, ConfigStatus, CLUSTER_CONFIG_NAME, DEFAULT_TARGET_NAMESPACE,
};
use crate::installer::Installer;
use crate::manifests::{readiness_targets, Component};
use crate::rbac::{ensure_namespace_rbac, is_system_namespace};
use crate::version::VersionResolver;
use crate::waiter::{ConvergenceWaiter, PollPolicy};

/// 自定义资源上的 finalizer
pub const FINALIZER: &str = "operator.tekton.dev/finalizer";

/// 默认安装的基础平台版本
pub const DEFAULT_PIPELINE_VERSION: &str = "v0.10.1";

/// 协调参数
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSettings {
    /// 资源未指定时使用的目标命名空间
    pub default_target_namespace: String,
    /// 基础平台版本
    pub pipeline_version: String,
    /// 就绪等待策略
    pub poll: PollPolicy,
    /// 已收敛资源的重新检查周期
    pub resync_interval: Duration,
    /// 等待依赖就绪时的重新排队间隔
    pub dependency_requeue: Duration,
    /// 失败重试的基础间隔
    pub error_requeue: Duration,
    /// 失败重试的最大间隔
    pub max_error_requeue: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            default_target_namespace: DEFAULT_TARGET_NAMESPACE.to_string(),
            pipeline_version: DEFAULT_PIPELINE_VERSION.to_string(),
            poll: PollPolicy::default(),
            resync_interval: Duration::from_secs(300),
            dependency_requeue: Duration::from_secs(10),
            error_requeue: Duration::from_secs(30),
            max_error_requeue: Duration::from_secs(600),
        }
    }
}

/// 协调器状态
#[derive(Default, Debug, Clone)]
pub struct ReconcilerState {
    /// 已执行的协调次数
    pub reconciliations: u64,
    /// 上次协调时间
    pub last_reconcile_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// 带状态条件的自定义资源
trait Managed:
    Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    type Status: Default + Clone + PartialEq + Send + Sync;

    const KIND: ObjectKind;

    fn status_mut(&mut self) -> &mut Option<Self::Status>;

    fn conditions_mut(status: &mut Self::Status) -> &mut Vec<Condition>;
}

impl Managed for Config {
    type Status = ConfigStatus;

    const KIND: ObjectKind = ObjectKind::Config;

    fn status_mut(&mut self) -> &mut Option<ConfigStatus> {
        &mut self.status
    }

    fn conditions_mut(status: &mut ConfigStatus) -> &mut Vec<Condition> {
        &mut status.conditions
    }
}

impl Managed for Addon {
    type Status = AddonStatus;

    const KIND: ObjectKind = ObjectKind::Addon;

    fn status_mut(&mut self) -> &mut Option<AddonStatus> {
        &mut self.status
    }

    fn conditions_mut(status: &mut AddonStatus) -> &mut Vec<Condition> {
        &mut status.conditions
    }
}

/// 失败对应的 `Error` 条件
fn error_condition(err: &Error) -> Condition {
    Condition::new(InstallStatus::Error, err.reason(), err.to_string())
}

/// 安装器错误统一包装为 `InstallerFailure`，写入冲突与暂时性 API 错误保持原样以便静默重试
fn installer_error(err: Error) -> Error {
    match err {
        Error::Conflict { .. } | Error::Transient(_) | Error::InstallerFailure(_) => err,
        other => Error::InstallerFailure(other.to_string()),
    }
}

/// 协调器结构体
pub struct Reconciler {
    /// 集群状态客户端
    client: SharedClusterState,
    /// 组件安装器
    installer: Arc<dyn Installer>,
    /// 插件版本解析器
    resolver: VersionResolver,
    /// 就绪等待器
    waiter: ConvergenceWaiter,
    /// 协调参数
    settings: ReconcileSettings,
    /// 协调状态
    state: Arc<RwLock<ReconcilerState>>,
    /// 每个资源的连续失败次数
    error_counts: DashMap<String, u32>,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(
        client: SharedClusterState,
        installer: Arc<dyn Installer>,
        resolver: VersionResolver,
        settings: ReconcileSettings,
    ) -> Self {
        let waiter = ConvergenceWaiter::new(client.clone(), settings.poll.clone());
        Self {
            client,
            installer,
            resolver,
            waiter,
            settings,
            state: Arc::new(RwLock::new(ReconcilerState::default())),
            error_counts: DashMap::new(),
        }
    }

    /// 协调参数
    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// 获取协调器状态
    pub async fn get_state(&self) -> ReconcilerState {
        self.state.read().await.clone()
    }

    /// 协调基础平台配置
    #[instrument(skip(self), fields(kind = "Config"))]
    pub async fn reconcile_config(&self, name: &str) -> Result<Action> {
        self.record_reconcile().await;
        let result = self.apply_config(name).await;
        self.finish(ObjectKind::Config, name, result)
    }

    /// 协调插件
    #[instrument(skip(self), fields(kind = "Addon"))]
    pub async fn reconcile_addon(&self, name: &str) -> Result<Action> {
        self.record_reconcile().await;
        let result = self.apply_addon(name).await;
        self.finish(ObjectKind::Addon, name, result)
    }

    /// 协调命名空间的流水线权限
    #[instrument(skip(self), fields(kind = "Namespace"))]
    pub async fn reconcile_namespace(&self, name: &str) -> Result<Action> {
        self.record_reconcile().await;
        let result = self.apply_namespace(name).await;
        self.finish(ObjectKind::Namespace, name, result)
    }

    /// 处理错误，按连续失败次数指数退避
    pub fn handle_error(&self, kind: ObjectKind, name: &str, error: &Error) -> Action {
        let key = format!("{}/{}", kind, name);
        let retries = {
            let mut entry = self.error_counts.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = Error::backoff_delay(
            retries,
            self.settings.error_requeue,
            self.settings.max_error_requeue,
        );

        if error.is_retryable() {
            warn!(resource = %key, error = %error, retry = retries, delay_secs = delay.as_secs(), "协调失败，稍后重试");
        } else {
            error!(resource = %key, error = %error, retry = retries, delay_secs = delay.as_secs(), "协调失败，等待外部条件变化");
        }

        Action::requeue(delay)
    }

    async fn record_reconcile(&self) {
        let mut state = self.state.write().await;
        state.reconciliations += 1;
        state.last_reconcile_time = Some(chrono::Utc::now());
    }

    /// 成功时清零失败计数
    fn finish(&self, kind: ObjectKind, name: &str, result: Result<Action>) -> Result<Action> {
        if result.is_ok() {
            self.error_counts.remove(&format!("{}/{}", kind, name));
        }
        result
    }

    async fn apply_config(&self, name: &str) -> Result<Action> {
        let mut config: Config = match fetch(self.client.as_ref(), ObjectKind::Config, None, name).await? {
            Some(config) => config,
            None => {
                debug!(name = %name, "Config 已不存在");
                return Ok(Action::await_change());
            }
        };

        if name != CLUSTER_CONFIG_NAME {
            if !config.is_deleting() {
                let err = Error::InvalidSpec(format!(
                    "Config 只能命名为 {:?}，忽略 {:?}",
                    CLUSTER_CONFIG_NAME, name
                ));
                warn!(name = %name, "忽略非单例 Config");
                self.write_status(&mut config, error_condition(&err), |_| {}).await?;
            }
            return Ok(Action::await_change());
        }

        if config.is_deleting() {
            return self.finalize_config(config).await;
        }

        self.ensure_finalizer(&mut config).await?;

        let target_namespace = config.spec.target_namespace.clone();
        let installed_namespace = config.status.as_ref().and_then(|s| s.target_namespace.clone());
        if let Some(installed) = installed_namespace {
            if installed != target_namespace {
                warn!(installed = %installed, requested = %target_namespace, "目标命名空间不可修改");
                let condition = Condition::new(
                    InstallStatus::Error,
                    "ImmutableTargetNamespace",
                    format!(
                        "基础平台已安装在命名空间 {}，不能迁移到 {}",
                        installed, target_namespace
                    ),
                );
                self.write_status(&mut config, condition, |_| {}).await?;
                return Ok(Action::await_change());
            }
        }

        if config.install_state() == InstallState::Installed {
            debug!(namespace = %target_namespace, "基础平台已安装，无需变更");
            return Ok(Action::requeue(self.settings.resync_interval));
        }

        match self.install_config(&mut config, &target_namespace).await {
            Ok(()) => Ok(Action::requeue(self.settings.resync_interval)),
            Err(e) => {
                self.record_failure(&mut config, &e).await;
                Err(e)
            }
        }
    }

    async fn install_config(&self, config: &mut Config, namespace: &str) -> Result<()> {
        let version = self.settings.pipeline_version.clone();
        self.write_status(
            config,
            Condition::new(
                InstallStatus::Installing,
                "Installing",
                format!("正在安装 Tekton Pipelines {} 到命名空间 {}", version, namespace),
            ),
            |_| {},
        )
        .await?;

        let owner = owner_reference(&*config)?;
        self.installer
            .apply(&Component::Pipeline, namespace, &version, &owner)
            .await
            .map_err(installer_error)?;
        self.wait_ready(&Component::Pipeline, namespace).await?;

        let generation = config.metadata.generation;
        let installed_namespace = namespace.to_string();
        self.write_status(
            config,
            Condition::new(
                InstallStatus::Installed,
                "Installed",
                format!("Tekton Pipelines {} 已就绪", version),
            ),
            move |status| {
                status.target_namespace = Some(installed_namespace);
                status.observed_generation = generation;
            },
        )
        .await?;

        info!(namespace = %namespace, version = %version, "基础平台安装完成");
        Ok(())
    }

    async fn finalize_config(&self, mut config: Config) -> Result<Action> {
        if !has_finalizer(&config) {
            return Ok(Action::await_change());
        }

        let mut addons: Vec<String> = self
            .client
            .list(ObjectKind::Addon, None, &Labels::new())
            .await?
            .into_iter()
            .filter_map(|addon| addon.metadata.name)
            .collect();
        if !addons.is_empty() {
            addons.sort();
            let err = Error::DependentsStillInstalled(addons);
            warn!(error = %err, "插件未删除，暂缓卸载基础平台");
            self.record_failure(&mut config, &err).await;
            return Err(err);
        }

        let namespace = config.installed_namespace().to_string();
        info!(namespace = %namespace, "卸载基础平台");
        self.installer
            .remove(&Component::Pipeline, &namespace)
            .await
            .map_err(installer_error)?;
        if let Some(uid) = config.uid() {
            self.cleanup_owned(&uid).await?;
        }

        self.remove_finalizer(&mut config).await?;
        info!(namespace = %namespace, "基础平台已卸载");
        Ok(Action::await_change())
    }

    async fn apply_addon(&self, name: &str) -> Result<Action> {
        let mut addon: Addon = match fetch(self.client.as_ref(), ObjectKind::Addon, None, name).await? {
            Some(addon) => addon,
            None => {
                debug!(name = %name, "Addon 已不存在");
                return Ok(Action::await_change());
            }
        };
        let config: Option<Config> =
            fetch(self.client.as_ref(), ObjectKind::Config, None, CLUSTER_CONFIG_NAME).await?;

        if addon.is_deleting() {
            return self.finalize_addon(addon, config.as_ref()).await;
        }

        self.ensure_finalizer(&mut addon).await?;

        // 基础平台未就绪时等待，不产生状态变化
        let config = match config {
            Some(config) if !config.is_deleting() && config.install_state() == InstallState::Installed => config,
            _ => {
                info!(addon = %name, "基础平台尚未就绪，稍后重试");
                return Ok(Action::requeue(self.settings.dependency_requeue));
            }
        };
        let namespace = config.installed_namespace().to_string();

        if addon.install_state() == InstallState::Installed && !addon.spec_changed(&namespace) {
            debug!(addon = %name, "插件已安装，无需变更");
            return Ok(Action::requeue(self.settings.resync_interval));
        }

        match self.install_addon(&mut addon, &namespace).await {
            Ok(()) => Ok(Action::requeue(self.settings.resync_interval)),
            Err(e) => {
                self.record_failure(&mut addon, &e).await;
                Err(e)
            }
        }
    }

    async fn install_addon(&self, addon: &mut Addon, namespace: &str) -> Result<()> {
        let name = addon.name_any();
        let version = self.resolver.resolve(&name, addon.requested_version())?;

        self.write_status(
            addon,
            Condition::new(
                InstallStatus::Installing,
                "Installing",
                format!("正在安装插件 {} {}", name, version),
            ),
            |_| {},
        )
        .await?;

        let component = Component::addon(name.clone());
        let owner = owner_reference(&*addon)?;
        self.installer
            .apply(&component, namespace, &version, &owner)
            .await
            .map_err(installer_error)?;
        self.wait_ready(&component, namespace).await?;

        let generation = addon.metadata.generation;
        let installed_version = version.clone();
        let installed_namespace = namespace.to_string();
        self.write_status(
            addon,
            Condition::new(
                InstallStatus::Installed,
                "Installed",
                format!("插件 {} {} 已就绪", name, version),
            ),
            move |status| {
                status.version = Some(installed_version);
                status.target_namespace = Some(installed_namespace);
                status.observed_generation = generation;
            },
        )
        .await?;

        info!(addon = %name, version = %version, namespace = %namespace, "插件安装完成");
        Ok(())
    }

    async fn finalize_addon(&self, mut addon: Addon, config: Option<&Config>) -> Result<Action> {
        if !has_finalizer(&addon) {
            return Ok(Action::await_change());
        }

        let name = addon.name_any();
        let namespace = addon
            .status
            .as_ref()
            .and_then(|s| s.target_namespace.clone())
            .or_else(|| config.map(|c| c.installed_namespace().to_string()))
            .unwrap_or_else(|| self.settings.default_target_namespace.clone());

        info!(addon = %name, namespace = %namespace, "卸载插件");
        self.installer
            .remove(&Component::addon(name.clone()), &namespace)
            .await
            .map_err(installer_error)?;
        if let Some(uid) = addon.uid() {
            self.cleanup_owned(&uid).await?;
        }

        self.remove_finalizer(&mut addon).await?;
        info!(addon = %name, "插件已卸载");
        Ok(Action::await_change())
    }

    async fn apply_namespace(&self, name: &str) -> Result<Action> {
        let namespace = match get_opt(self.client.as_ref(), ObjectKind::Namespace, None, name).await? {
            Some(namespace) => namespace,
            None => return Ok(Action::await_change()),
        };
        if namespace.metadata.deletion_timestamp.is_some() || is_system_namespace(name) {
            return Ok(Action::await_change());
        }

        let config = match fetch::<Config>(self.client.as_ref(), ObjectKind::Config, None, CLUSTER_CONFIG_NAME).await? {
            Some(config) if !config.is_deleting() && config.install_state() == InstallState::Installed => config,
            _ => {
                debug!(namespace = %name, "基础平台尚未就绪，稍后补齐流水线权限");
                return Ok(Action::requeue(self.settings.dependency_requeue));
            }
        };
        if config.installed_namespace() == name {
            return Ok(Action::await_change());
        }

        let owner = owner_reference(&config)?;
        let created = ensure_namespace_rbac(self.client.as_ref(), name, &owner).await?;
        if created > 0 {
            info!(namespace = %name, created = created, "已创建流水线权限");
        }
        Ok(Action::requeue(self.settings.resync_interval))
    }

    /// 等待组件全部就绪
    async fn wait_ready(&self, component: &Component, namespace: &str) -> Result<()> {
        let targets = readiness_targets(component, namespace);
        let policy = self.waiter.policy();
        self.waiter
            .wait_for_all_ready(&targets, policy.timeout, policy.interval)
            .await
    }

    /// 删除资源拥有的剩余对象并等待删除完成
    async fn cleanup_owned(&self, owner_uid: &str) -> Result<()> {
        let owned = owned_objects(self.client.as_ref(), owner_uid).await?;
        for key in &owned {
            if delete_if_exists(self.client.as_ref(), key.kind, key.namespace(), &key.name).await? {
                debug!(object = %key, "已删除托管对象");
            }
        }

        let policy = self.waiter.policy();
        for key in &owned {
            self.waiter
                .wait_for_removed(key, policy.timeout, policy.interval)
                .await?;
        }
        Ok(())
    }

    /// 写入状态条件，与当前条件相同且其他字段未变时不写入
    async fn write_status<K, F>(&self, obj: &mut K, condition: Condition, mutate: F) -> Result<()>
    where
        K: Managed,
        F: FnOnce(&mut K::Status) + Send,
    {
        let previous = obj.status_mut().clone();
        let mut status = previous.clone().unwrap_or_default();
        let code = condition.code;
        let pushed = push_condition(K::conditions_mut(&mut status), condition);
        mutate(&mut status);

        if !pushed && previous.as_ref() == Some(&status) {
            return Ok(());
        }

        *obj.status_mut() = Some(status);
        let updated = self.client.update_status(K::KIND, to_dynamic(&*obj)?).await?;
        *obj = from_dynamic(updated)?;
        debug!(kind = %K::KIND, name = %obj.name_any(), code = %code, "已更新状态");
        Ok(())
    }

    /// 失败需要呈现给用户时写入 `Error` 条件
    async fn record_failure<K: Managed>(&self, obj: &mut K, err: &Error) {
        if !err.surfaces_as_condition() {
            return;
        }
        if let Err(write_err) = self.write_status(obj, error_condition(err), |_| {}).await {
            warn!(error = %write_err, "写入错误状态失败");
        }
    }

    async fn ensure_finalizer<K: Managed>(&self, obj: &mut K) -> Result<()> {
        if has_finalizer(obj) {
            return Ok(());
        }

        obj.finalizers_mut().push(FINALIZER.to_string());
        let updated = self.client.update(K::KIND, to_dynamic(&*obj)?).await?;
        *obj = from_dynamic(updated)?;
        debug!(kind = %K::KIND, name = %obj.name_any(), "已添加 finalizer");
        Ok(())
    }

    async fn remove_finalizer<K: Managed>(&self, obj: &mut K) -> Result<()> {
        obj.finalizers_mut().retain(|f| f != FINALIZER);
        self.client.update(K::KIND, to_dynamic(&*obj)?).await?;
        Ok(())
    }
}

fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}
