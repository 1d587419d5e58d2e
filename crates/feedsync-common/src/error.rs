//! 错误处理模块
//!
//! 该模块提供 FeedSync 项目的统一错误处理机制。错误值会被传递给失败回调，
//! 并以文本形式写入威胁源的状态条件，因此所有变体都可以克隆。

use std::io;
use thiserror::Error;

/// FeedSync 统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    Network(String),

    /// Elasticsearch 返回了非成功状态码
    #[error("Elasticsearch 错误 (HTTP {status}): {reason}")]
    Elastic {
        /// HTTP 状态码
        status: u16,
        /// 响应中的错误原因
        reason: String,
    },

    /// Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kube(String),

    /// 威胁源内容解析错误
    #[error("解析错误: {0}")]
    Parse(String),

    /// 循环尚未启动
    #[error("运行循环尚未启动")]
    NotStarted,

    /// 循环已经终止
    #[error("运行循环已终止")]
    Terminated,

    /// 上下文已取消
    #[error("上下文已取消")]
    Cancelled,

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(String),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(String),
}

/// FeedSync 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl Error {
    /// 是否为“对象不存在”类错误
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Elastic { status: 404, .. })
    }
}
