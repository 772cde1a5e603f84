//! Tekton Operator Common - 跨模块共享工具与数据结构
//!
//! 该模块提供 Tekton Operator 中所有组件共享的数据结构与统一的错误处理机制。
//! 包括安装状态条件、发布版本等数据模型。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::condition::*;
pub use models::version::*;
