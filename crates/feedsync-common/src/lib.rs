//! FeedSync Common - 跨模块共享的数据模型与错误处理
//!
//! 该模块提供 FeedSync 项目中所有组件共享的数据结构、状态上报接口和统一错误类型。
//! 包括 IP 集合、域名集合、后端元数据以及威胁源状态等模型。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::sets::*;
pub use models::status::*;
