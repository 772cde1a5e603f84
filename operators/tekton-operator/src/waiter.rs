//! 收敛等待模块
//!
//! 安装或删除请求提交后，集群对象需要一段时间才能达到期望状态。`ConvergenceWaiter`
//! 轮询集群状态直到对象就绪或被完全删除；轮询期间的任何客户端错误都被容忍，
//! 只有超过截止时间才返回 `Timeout`。

use kube::core::DynamicObject;
use std::future::Future;
use std::time::Duration;
use tekton_common::{Error, Result};
use tracing::{debug, trace};

use crate::cluster::{get_opt, ObjectKey, ObjectKind, SharedClusterState};

/// 轮询策略
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// 默认超时
    pub timeout: Duration,
    /// 初始轮询间隔
    pub interval: Duration,
    /// 轮询间隔上限
    pub max_interval: Duration,
    /// 每次未满足后的间隔倍数
    pub multiplier: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(5000),
            multiplier: 1.5,
        }
    }
}

impl PollPolicy {
    /// 下一次轮询间隔
    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max_interval.max(current))
    }
}

/// 就绪判定方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Deployment 的当前 generation 已完成滚动更新且就绪副本达到期望值
    Deployment { replicas: i32 },
    /// 对象存在即就绪
    Exists,
}

/// 需要等待就绪的组件对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRef {
    pub key: ObjectKey,
    pub readiness: Readiness,
}

impl ComponentRef {
    /// Deployment 就绪目标
    pub fn deployment(namespace: &str, name: impl Into<String>, replicas: i32) -> Self {
        Self {
            key: ObjectKey::new(ObjectKind::Deployment, Some(namespace), name),
            readiness: Readiness::Deployment { replicas },
        }
    }

    /// 存在即就绪的目标
    pub fn exists(kind: ObjectKind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            key: ObjectKey::new(kind, namespace, name),
            readiness: Readiness::Exists,
        }
    }
}

/// Deployment 的最新版本是否已完成滚动更新
///
/// 旧 ReplicaSet 的 Pod 也计入 `readyReplicas`，因此还要求控制器已观察到当前
/// generation，并且更新后的副本数达到期望值。
fn deployment_rolled_out(obj: &DynamicObject, replicas: i64) -> bool {
    let status = &obj.data["status"];
    let observed = status["observedGeneration"].as_i64().unwrap_or(0);
    let generation = obj.metadata.generation.unwrap_or(0);
    let updated = status["updatedReplicas"].as_i64().unwrap_or(0);
    let ready = status["readyReplicas"].as_i64().unwrap_or(0);

    observed >= generation && updated >= replicas && ready >= replicas
}

/// 收敛等待器
#[derive(Clone)]
pub struct ConvergenceWaiter {
    client: SharedClusterState,
    policy: PollPolicy,
}

impl ConvergenceWaiter {
    pub fn new(client: SharedClusterState, policy: PollPolicy) -> Self {
        Self { client, policy }
    }

    /// 轮询策略
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// 等待单个对象就绪
    pub async fn wait_for_ready(
        &self,
        target: &ComponentRef,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        self.wait_for_all_ready(std::slice::from_ref(target), timeout, poll_interval)
            .await
    }

    /// 在同一截止时间内等待一组对象全部就绪
    pub async fn wait_for_all_ready(
        &self,
        targets: &[ComponentRef],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let description = targets
            .iter()
            .map(|t| t.key.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        debug!(targets = %description, timeout = ?timeout, "等待组件就绪");

        let timeout_msg = format!("等待就绪: {}", description);
        self.poll_until(timeout, poll_interval, timeout_msg, move || async move {
            for target in targets {
                if !self.is_ready(target).await? {
                    trace!(target = %target.key, "对象尚未就绪");
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await
    }

    /// 等待对象被完全删除
    pub async fn wait_for_removed(
        &self,
        key: &ObjectKey,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        debug!(object = %key, timeout = ?timeout, "等待对象删除");

        let timeout_msg = format!("等待删除: {}", key);
        self.poll_until(timeout, poll_interval, timeout_msg, move || async move {
            let obj = get_opt(self.client.as_ref(), key.kind, key.namespace(), &key.name).await?;
            Ok(obj.is_none())
        })
        .await
    }

    /// 单次探测
    async fn is_ready(&self, target: &ComponentRef) -> Result<bool> {
        let key = &target.key;
        let obj = match get_opt(self.client.as_ref(), key.kind, key.namespace(), &key.name).await? {
            Some(obj) => obj,
            None => return Ok(false),
        };

        Ok(match target.readiness {
            Readiness::Exists => true,
            Readiness::Deployment { replicas } => deployment_rolled_out(&obj, i64::from(replicas)),
        })
    }

    /// 反复执行检查直到返回 `true`，超过截止时间返回 `Timeout`
    async fn poll_until<F, Fut>(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        timeout_msg: String,
        mut check_fn: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let poll = async {
            let mut interval = poll_interval;
            loop {
                match check_fn().await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => trace!(error = %e, "轮询检查失败，继续重试"),
                }

                tokio::time::sleep(interval).await;
                interval = self.policy.next_interval(interval);
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::Timeout(timeout_msg))
    }
}
