//! 集合后端接口
//!
//! 集合协调器通过 `put`/`list`/`delete` 三个操作与具体存储交互。
//! 所有操作都必须可以安全地重复执行。

use async_trait::async_trait;
use feedsync_common::{Meta, Result};

/// 集合后端
#[async_trait]
pub trait SetBackend: Send + Sync + 'static {
    /// 后端存储的内容类型
    type Payload: Clone + Send + Sync + 'static;

    /// 写入失败时使用的状态条件类型
    const SYNC_FAILURE: &'static str;

    /// 写入或覆盖一个对象
    async fn put(&self, name: &str, value: &Self::Payload) -> Result<()>;

    /// 列举后端中的所有对象
    async fn list(&self) -> Result<Vec<Meta>>;

    /// 删除一个对象，对象不存在时视为成功
    async fn delete(&self, meta: &Meta) -> Result<()>;
}
