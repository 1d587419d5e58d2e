//! 协调器接口
//!
//! 两种协调器实现（基于通道的集合协调器与基于 informer/workqueue 的
//! GlobalNetworkSet 控制器）共享同一个 [`Reconciler`] 接口，调用方无需关心
//! 后端的具体类型。

use std::sync::Arc;

use async_trait::async_trait;
use feedsync_common::{Error, Statser};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 默认协调周期（秒）
pub const DEFAULT_RECONCILE_PERIOD_SECS: u64 = 15;
/// 默认更新队列容量
pub const DEFAULT_UPDATE_QUEUE_LEN: usize = 1000;
/// 默认客户端重试次数
pub const DEFAULT_CLIENT_RETRIES: u32 = 5;

/// 写入失败回调，每次写入失败最多调用一次
pub type FailFn = Arc<dyn Fn(&Error) + Send + Sync>;

/// 不做任何事情的失败回调
pub fn noop_fail() -> FailFn {
    Arc::new(|_| {})
}

/// 期望状态协调器
///
/// 所有意图通过发送给协调器的属主任务生效。若在发送完成前 `ctx` 被取消，
/// 意图会被丢弃，调用方需要在更高层重试（例如下一次拉取）。
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// 对象内容类型
    type Payload: Send + 'static;

    /// 写入或替换一个对象
    async fn add(
        &self,
        ctx: &CancellationToken,
        name: &str,
        value: Self::Payload,
        fail: FailFn,
        statser: Arc<dyn Statser>,
    );

    /// 删除一个对象
    async fn delete(&self, ctx: &CancellationToken, name: &str);

    /// 保留一个对象，使其免于垃圾回收
    async fn no_gc(&self, ctx: &CancellationToken, name: &str);

    /// 结束预热阶段，开始周期性协调
    async fn start_reconciliation(&self, ctx: &CancellationToken);

    /// 启动属主任务，重复调用无效
    fn run(&self, shutdown: CancellationToken);
}

/// 发送一个意图，直到成功或 `ctx` 被取消
///
/// 返回意图是否已被送达。
pub async fn send_intent<T>(tx: &mpsc::Sender<T>, ctx: &CancellationToken, intent: T) -> bool {
    tokio::select! {
        _ = ctx.cancelled() => {
            debug!("上下文已取消，丢弃意图");
            false
        }
        res = tx.send(intent) => match res {
            Ok(()) => true,
            Err(_) => {
                warn!("协调器已终止，丢弃意图");
                false
            }
        }
    }
}
