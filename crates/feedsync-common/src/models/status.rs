//! 状态模型与状态上报接口
//!
//! 协调器只依赖 [`Statser`] 的两个方法来报告或清除错误条件，
//! 错误最终如何呈现（CRD 状态、内存中的测试替身等）由实现方决定。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// 拉取威胁源失败
pub const PULL_FAILED: &str = "PullFailed";
/// 写入 Elasticsearch 失败
pub const ELASTIC_SYNC_FAILED: &str = "ElasticSyncFailed";
/// 同步 GlobalNetworkSet 失败
pub const GLOBAL_NETWORK_SET_SYNC_FAILED: &str = "GlobalNetworkSetSyncFailed";
/// 回收孤立对象失败
pub const GARBAGE_COLLECTION_FAILED: &str = "GarbageCollectionFailed";

/// 状态上报接口
pub trait Statser: Send + Sync {
    /// 记录一个错误条件，同类型的旧条件会被替换
    fn error(&self, kind: &str, err: &Error);

    /// 清除指定类型的错误条件
    fn clear_error(&self, kind: &str);

    /// 记录一次成功同步
    fn successful_sync(&self) {}
}

/// 错误条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCondition {
    /// 条件类型
    #[serde(rename = "type")]
    pub kind: String,
    /// 错误信息
    pub message: String,
}

/// 威胁源状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    /// 上次成功同步时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// 当前错误条件
    #[serde(default)]
    pub error_conditions: Vec<ErrorCondition>,
}

impl FeedStatus {
    /// 写入错误条件，替换同类型的旧条件
    pub fn set_error(&mut self, kind: &str, message: impl Into<String>) {
        self.error_conditions.retain(|c| c.kind != kind);
        self.error_conditions.push(ErrorCondition {
            kind: kind.to_string(),
            message: message.into(),
        });
    }

    /// 清除指定类型的错误条件，返回是否有条件被移除
    pub fn clear_error(&mut self, kind: &str) -> bool {
        let before = self.error_conditions.len();
        self.error_conditions.retain(|c| c.kind != kind);
        before != self.error_conditions.len()
    }

    /// 是否存在指定类型的错误条件
    pub fn has_error(&self, kind: &str) -> bool {
        self.error_conditions.iter().any(|c| c.kind == kind)
    }
}
