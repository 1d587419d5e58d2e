//! FeedSync Controller - 期望状态协调引擎
//!
//! 该模块实现威胁源同步的核心逻辑：
//! - 调度原语（按需执行、周期循环、可重调度循环）
//! - 基于通道的集合协调器及其 Elasticsearch 后端
//! - 威胁源拉取器与 HTTP 威胁源
//! - 威胁源状态上报与配置加载

pub mod backend;
pub mod config;
pub mod elastic;
pub mod http;
pub mod puller;
pub mod reconciler;
pub mod runloop;
pub mod set_controller;
pub mod status;

/// 重新导出常用类型，方便使用
pub use backend::SetBackend;
pub use config::ControllerConfig;
pub use reconciler::{noop_fail, FailFn, Reconciler};
pub use set_controller::SetReconciler;
pub use status::{FeedStatser, StatusWriter};
