//! FeedSync Operator - 威胁源同步的 Kubernetes Operator
//!
//! 该模块监听 GlobalThreatFeed 自定义资源，周期性拉取威胁源，
//! 并把结果同步到 Elasticsearch 与 GlobalNetworkSet。

pub mod controller;
pub mod crd;
pub mod feed_watcher;
pub mod gns;
pub mod status_writer;
pub mod workqueue;

/// 重新导出常用类型，方便使用
pub use controller::Operator;
pub use feed_watcher::FeedWatcher;
pub use gns::GlobalNetworkSetController;
