//! 调度原语模块
//!
//! 系统中所有周期性或按需执行的任务（拉取威胁源、协调后端、写回状态）
//! 都建立在这里的三个原语之上：
//!
//! - [`on_demand`]：单槽合并执行器，突发的多次投递只会以最新值执行一次；
//! - [`run_loop`]：立即执行一次，之后按固定周期重复执行；
//! - [`run_loop_with_reschedule`]：在 `run_loop` 的基础上支持提前重调度与退避。

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedsync_common::{Error, Result};
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 单槽邮箱
struct Slot<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Slot<T> {
    fn put(&self, value: T) {
        let mut slot = self.value.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(value);
    }

    fn take(&self) -> Option<T> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// 按需执行器的投递端，可以任意克隆
pub struct Enqueuer<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Enqueuer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Enqueuer<T> {
    /// 投递一个值，覆盖尚未被消费的旧值，不会阻塞
    pub fn enqueue(&self, value: T) {
        self.slot.put(value);
        self.slot.notify.notify_one();
    }
}

/// 按需执行器的执行端
pub struct OnDemand<T> {
    slot: Arc<Slot<T>>,
}

impl<T: Send> OnDemand<T> {
    /// 逐个处理投递的值，直到 `token` 被取消
    ///
    /// 处理函数执行期间到达的多个值只保留最新的一个。取消会立即中断
    /// 正在等待中的处理函数。
    pub async fn run<F, Fut>(self, token: CancellationToken, mut handler: F)
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = self.slot.notify.notified() => {}
            }

            let Some(value) = self.slot.take() else {
                continue;
            };

            tokio::select! {
                _ = token.cancelled() => return,
                _ = handler(value) => {}
            }
        }
    }
}

/// 创建按需执行器，返回执行端与投递端
pub fn on_demand<T>() -> (OnDemand<T>, Enqueuer<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        notify: Notify::new(),
    });
    (OnDemand { slot: slot.clone() }, Enqueuer { slot })
}

/// 最短执行周期，更短的周期会被提升到该值
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// 创建首次在一个周期后触发的节拍器，错过的节拍直接跳过
pub(crate) fn ticker(period: Duration) -> Interval {
    let period = if period < MIN_PERIOD {
        warn!(period = ?period, min = ?MIN_PERIOD, "执行周期过短，使用最短周期");
        MIN_PERIOD
    } else {
        period
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// 立即执行 `f`，之后每隔 `period` 再执行一次，直到 `token` 被取消
///
/// 返回值为循环退出的原因，始终是 [`Error::Cancelled`]。
pub async fn run_loop<F, Fut>(token: CancellationToken, mut f: F, period: Duration) -> Error
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Error::Cancelled,
            _ = f() => {}
        }
        tokio::select! {
            _ = token.cancelled() => return Error::Cancelled,
            _ = ticker.tick() => {}
        }
    }
}

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const TERMINATED: u8 = 2;

struct RescheduleState {
    state: AtomicU8,
    tx: mpsc::Sender<()>,
}

/// 重调度句柄
///
/// 在循环启动前调用返回 [`Error::NotStarted`]，循环退出后调用返回
/// [`Error::Terminated`]。运行期间的多次调用会被合并为一次。
#[derive(Clone)]
pub struct Rescheduler {
    inner: Arc<RescheduleState>,
}

impl Rescheduler {
    /// 请求提前执行一次
    pub fn reschedule(&self) -> Result<()> {
        match self.inner.state.load(Ordering::Acquire) {
            NOT_STARTED => Err(Error::NotStarted),
            TERMINATED => Err(Error::Terminated),
            _ => match self.inner.tx.try_send(()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
                Err(mpsc::error::TrySendError::Closed(())) => Err(Error::Terminated),
            },
        }
    }
}

/// 支持重调度的周期循环
pub struct RescheduleLoop {
    inner: Arc<RescheduleState>,
    rx: mpsc::Receiver<()>,
}

impl RescheduleLoop {
    /// 与 [`run_loop`] 相同，但额外响应重调度请求
    ///
    /// 收到请求时先执行 `on_reschedule`，再等待 `backoff`，等待期间错过的
    /// 周期触发会被丢弃，之后恢复原有节拍。
    pub async fn run<F, FutF, G, FutG>(
        mut self,
        token: CancellationToken,
        mut f: F,
        period: Duration,
        mut on_reschedule: G,
        backoff: Duration,
    ) -> Error
    where
        F: FnMut() -> FutF,
        FutF: Future<Output = ()>,
        G: FnMut() -> FutG,
        FutG: Future<Output = ()>,
    {
        self.inner.state.store(RUNNING, Ordering::Release);

        let mut ticker = ticker(period);
        let reason = 'run: {
            tokio::select! {
                _ = token.cancelled() => break 'run Error::Cancelled,
                _ = f() => {}
            }

            loop {
                let rescheduled = tokio::select! {
                    _ = token.cancelled() => break 'run Error::Cancelled,
                    _ = ticker.tick() => false,
                    Some(()) = self.rx.recv() => true,
                };

                if !rescheduled {
                    tokio::select! {
                        _ = token.cancelled() => break 'run Error::Cancelled,
                        _ = f() => {}
                    }
                    continue;
                }

                debug!("收到重调度请求");
                tokio::select! {
                    _ = token.cancelled() => break 'run Error::Cancelled,
                    _ = on_reschedule() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break 'run Error::Cancelled,
                    _ = sleep(backoff) => {}
                }
                // 丢弃退避期间到期的节拍
                if ticker.tick().now_or_never().is_some() {
                    debug!("丢弃退避期间到期的周期触发");
                }
            }
        };

        self.inner.state.store(TERMINATED, Ordering::Release);
        self.rx.close();
        reason
    }
}

/// 创建支持重调度的周期循环，返回循环本体与重调度句柄
pub fn run_loop_with_reschedule() -> (RescheduleLoop, Rescheduler) {
    let (tx, rx) = mpsc::channel(1);
    let inner = Arc::new(RescheduleState {
        state: AtomicU8::new(NOT_STARTED),
        tx,
    });
    (
        RescheduleLoop {
            inner: inner.clone(),
            rx,
        },
        Rescheduler { inner },
    )
}
