//! 威胁源状态上报
//!
//! [`FeedStatser`] 在内存中维护单个威胁源的状态，每次变化都通过按需执行器
//! 投递给 [`StatusWriter`]，因此短时间内的多次变化只会产生一次写入。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use feedsync_common::{Error, FeedStatus, Result, Statser};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runloop::{on_demand, Enqueuer, OnDemand};

/// 状态写入接口
#[async_trait]
pub trait StatusWriter: Send + Sync + 'static {
    /// 写入威胁源状态
    async fn write_status(&self, name: &str, status: &FeedStatus) -> Result<()>;
}

/// 单个威胁源的状态上报器
pub struct FeedStatser {
    name: String,
    status: Mutex<FeedStatus>,
    enqueuer: Enqueuer<FeedStatus>,
    runner: Mutex<Option<OnDemand<FeedStatus>>>,
}

impl FeedStatser {
    /// 创建新的状态上报器
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_status(name, FeedStatus::default())
    }

    /// 以已有状态为起点创建状态上报器
    pub fn with_status(name: impl Into<String>, status: FeedStatus) -> Self {
        let (runner, enqueuer) = on_demand();
        Self {
            name: name.into(),
            status: Mutex::new(status),
            enqueuer,
            runner: Mutex::new(Some(runner)),
        }
    }

    /// 当前状态快照
    pub fn status(&self) -> FeedStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 启动状态写回任务，直到 `token` 被取消，重复调用无效
    pub fn run(&self, token: CancellationToken, writer: Arc<dyn StatusWriter>) {
        let runner = self.runner.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(runner) = runner else {
            debug!(name = %self.name, "状态写回任务已在运行");
            return;
        };

        let name = self.name.clone();
        tokio::spawn(async move {
            runner
                .run(token, |status: FeedStatus| {
                    let writer = writer.clone();
                    let name = name.clone();
                    async move {
                        if let Err(err) = writer.write_status(&name, &status).await {
                            warn!(name = %name, error = %err, "写回威胁源状态失败");
                        }
                    }
                })
                .await;
        });
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut FeedStatus) -> bool,
    {
        let snapshot = {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if !f(&mut status) {
                return;
            }
            status.clone()
        };
        self.enqueuer.enqueue(snapshot);
    }
}

impl Statser for FeedStatser {
    fn error(&self, kind: &str, err: &Error) {
        self.update(|status| {
            status.set_error(kind, err.to_string());
            true
        });
    }

    fn clear_error(&self, kind: &str) {
        self.update(|status| status.clear_error(kind));
    }

    fn successful_sync(&self) {
        self.update(|status| {
            status.last_successful_sync = Some(Utc::now());
            true
        });
    }
}
