//! 数据模型模块
//!
//! 该模块定义了 FeedSync 项目中使用的核心数据模型，包括集合内容、
//! 后端元数据和威胁源状态，并提供序列化/反序列化功能。

pub mod sets;
pub mod status;
