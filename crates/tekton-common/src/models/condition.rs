//! 安装状态条件模型
//!
//! 自定义资源的 `status.conditions` 按时间倒序保存：第一个条目即当前状态。
//! 写入与当前条目完全相同的条件是空操作，从而保证重复协调不会产生状态写入。

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 保留的条件历史条目上限
pub const MAX_CONDITIONS: usize = 10;

/// 条件代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum InstallStatus {
    /// 安装中
    Installing,
    /// 已安装
    Installed,
    /// 安装失败（可恢复）
    Error,
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InstallStatus::Installing => "Installing",
            InstallStatus::Installed => "Installed",
            InstallStatus::Error => "Error",
        };
        f.write_str(text)
    }
}

/// 协调状态机中的状态，`Absent` 表示尚无任何状态条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallState {
    Absent,
    Installing,
    Installed,
    Error,
}

impl From<InstallStatus> for InstallState {
    fn from(code: InstallStatus) -> Self {
        match code {
            InstallStatus::Installing => InstallState::Installing,
            InstallStatus::Installed => InstallState::Installed,
            InstallStatus::Error => InstallState::Error,
        }
    }
}

/// 单个状态条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// 条件代码
    pub code: InstallStatus,
    /// 机器可读原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// 人类可读信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 上次状态切换时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// 创建新的条件，切换时间取当前时间
    pub fn new(code: InstallStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_transition_time: Some(Utc::now()),
        }
    }

    /// 忽略时间戳比较两个条件
    pub fn same_as(&self, other: &Condition) -> bool {
        self.code == other.code && self.reason == other.reason && self.message == other.message
    }
}

/// 根据条件列表推导当前状态
pub fn current_state(conditions: &[Condition]) -> InstallState {
    conditions
        .first()
        .map(|c| InstallState::from(c.code))
        .unwrap_or(InstallState::Absent)
}

/// 将新条件写到列表头部
///
/// 返回 `false` 表示与当前条件相同，列表未被修改。
pub fn push_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    if let Some(current) = conditions.first() {
        if current.same_as(&condition) {
            return false;
        }
    }

    conditions.insert(0, condition);
    conditions.truncate(MAX_CONDITIONS);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_state() {
        assert_eq!(current_state(&[]), InstallState::Absent);

        let mut conditions = Vec::new();
        push_condition(&mut conditions, Condition::new(InstallStatus::Installing, "Installing", "a"));
        push_condition(&mut conditions, Condition::new(InstallStatus::Installed, "Installed", "b"));
        assert_eq!(current_state(&conditions), InstallState::Installed);
        assert_eq!(conditions[1].code, InstallStatus::Installing);
    }

    #[test]
    fn test_push_identical_condition_is_noop() {
        let mut conditions = Vec::new();
        assert!(push_condition(&mut conditions, Condition::new(InstallStatus::Error, "Timeout", "x")));
        assert!(!push_condition(&mut conditions, Condition::new(InstallStatus::Error, "Timeout", "x")));
        assert_eq!(conditions.len(), 1);

        // 信息不同则视为新的条件
        assert!(push_condition(&mut conditions, Condition::new(InstallStatus::Error, "Timeout", "y")));
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut conditions = Vec::new();
        for i in 0..(MAX_CONDITIONS + 5) {
            push_condition(
                &mut conditions,
                Condition::new(InstallStatus::Installing, "Installing", format!("attempt {}", i)),
            );
        }
        assert_eq!(conditions.len(), MAX_CONDITIONS);
        assert_eq!(
            conditions[0].message.as_deref(),
            Some(format!("attempt {}", MAX_CONDITIONS + 4).as_str())
        );
    }

    #[test]
    fn test_condition_serialization() {
        let condition = Condition::new(InstallStatus::Installed, "Installed", "ok");
        let value = serde_json::to_value(&condition).unwrap();
        assert_eq!(value["code"], "Installed");
        assert!(value.get("lastTransitionTime").is_some());
    }
}
