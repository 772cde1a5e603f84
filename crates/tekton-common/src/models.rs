//! 数据模型模块
//!
//! 该模块定义了 Tekton Operator 中使用的核心数据模型，包括安装状态条件
//! 与插件发布版本，并提供序列化/反序列化功能。

pub mod condition;
pub mod version;
