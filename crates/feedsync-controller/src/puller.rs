//! 威胁源拉取器
//!
//! 每个威胁源对应一个 [`Puller`]：启动时立即拉取一次，之后按周期拉取，
//! 并把结果发布给所有配置的发布目标（集合协调器、GlobalNetworkSet 控制器）。
//! 拉取失败或下游写入失败都会请求重调度，下一次拉取至少间隔退避时间。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feedsync_common::{Result, Statser, PULL_FAILED};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconciler::{FailFn, Reconciler};
use crate::runloop::{run_loop_with_reschedule, Rescheduler};

/// 威胁源内容提供方
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    /// 拉取得到的内容类型
    type Payload: Clone + Send + Sync + 'static;

    /// 拉取一次威胁源内容
    async fn fetch(&self) -> Result<Self::Payload>;
}

/// 拉取结果的发布目标
#[async_trait]
pub trait Publisher<P: Send + 'static>: Send + Sync {
    /// 发布一次拉取结果
    async fn publish(
        &self,
        ctx: &CancellationToken,
        name: &str,
        value: P,
        fail: FailFn,
        statser: Arc<dyn Statser>,
    );
}

/// 直接把拉取结果交给协调器的发布目标
pub struct ReconcilerPublisher<R: ?Sized> {
    reconciler: Arc<R>,
}

impl<R: ?Sized> ReconcilerPublisher<R> {
    pub fn new(reconciler: Arc<R>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl<R> Publisher<R::Payload> for ReconcilerPublisher<R>
where
    R: Reconciler + ?Sized + 'static,
{
    async fn publish(
        &self,
        ctx: &CancellationToken,
        name: &str,
        value: R::Payload,
        fail: FailFn,
        statser: Arc<dyn Statser>,
    ) {
        self.reconciler.add(ctx, name, value, fail, statser).await;
    }
}

/// 威胁源拉取器
pub struct Puller<S: FeedSource> {
    name: String,
    source: Arc<S>,
    publishers: Vec<Arc<dyn Publisher<S::Payload>>>,
    statser: Arc<dyn Statser>,
    /// 所有拉取器共享的并发许可
    semaphore: Arc<Semaphore>,
    period: Duration,
    backoff: Duration,
}

impl<S: FeedSource> Puller<S> {
    /// 创建新的拉取器
    pub fn new(
        name: impl Into<String>,
        source: Arc<S>,
        statser: Arc<dyn Statser>,
        semaphore: Arc<Semaphore>,
        period: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            publishers: Vec::new(),
            statser,
            semaphore,
            period,
            backoff,
        }
    }

    /// 添加一个发布目标
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher<S::Payload>>) -> Self {
        self.publishers.push(publisher);
        self
    }

    /// 启动拉取循环，直到 `token` 被取消
    pub fn run(self, token: CancellationToken) -> JoinHandle<()> {
        let (run_loop, rescheduler) = run_loop_with_reschedule();
        let fail = reschedule_on_failure(self.name.clone(), rescheduler.clone());

        tokio::spawn(async move {
            info!(name = %self.name, period = ?self.period, "启动威胁源拉取");
            let this = &self;
            let reason = run_loop
                .run(
                    token.clone(),
                    || this.pull(&token, &fail, &rescheduler),
                    this.period,
                    || this.pull(&token, &fail, &rescheduler),
                    this.backoff,
                )
                .await;
            debug!(name = %self.name, reason = %reason, "威胁源拉取已停止");
        })
    }

    async fn pull(&self, ctx: &CancellationToken, fail: &FailFn, rescheduler: &Rescheduler) {
        let payload = {
            let _permit = match self.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(name = %self.name, "拉取许可已关闭");
                    return;
                }
            };
            debug!(name = %self.name, "开始拉取威胁源");
            self.source.fetch().await
        };

        match payload {
            Ok(payload) => {
                self.statser.clear_error(PULL_FAILED);
                self.statser.successful_sync();
                for publisher in &self.publishers {
                    publisher
                        .publish(
                            ctx,
                            &self.name,
                            payload.clone(),
                            fail.clone(),
                            self.statser.clone(),
                        )
                        .await;
                }
            }
            Err(err) => {
                warn!(name = %self.name, error = %err, "拉取威胁源失败");
                self.statser.error(PULL_FAILED, &err);
                if let Err(err) = rescheduler.reschedule() {
                    debug!(name = %self.name, error = %err, "重调度失败");
                }
            }
        }
    }
}

/// 下游写入失败时请求重调度的回调
fn reschedule_on_failure(name: String, rescheduler: Rescheduler) -> FailFn {
    Arc::new(move |err| {
        debug!(name = %name, error = %err, "下游写入失败，请求重新拉取");
        if let Err(err) = rescheduler.reschedule() {
            debug!(name = %name, error = %err, "重调度失败");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::FeedStatser;
    use feedsync_common::{Error, IpSetSpec};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 按脚本返回结果的威胁源，脚本耗尽后总是成功
    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<IpSetSpec>>>,
        fetches: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedSource {
        fn failing(times: usize) -> Self {
            let source = Self::default();
            for _ in 0..times {
                source
                    .script
                    .lock()
                    .unwrap()
                    .push_back(Err(Error::Network("连接被拒绝".into())));
            }
            source
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedSource {
        type Payload = IpSetSpec;

        async fn fetch(&self) -> Result<IpSetSpec> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(IpSetSpec(vec!["1.2.3.4/32".to_string()])))
        }
    }

    /// 记录发布内容，并可让前若干次发布以写入失败结束
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, IpSetSpec)>>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Publisher<IpSetSpec> for RecordingPublisher {
        async fn publish(
            &self,
            _ctx: &CancellationToken,
            name: &str,
            value: IpSetSpec,
            fail: FailFn,
            _statser: Arc<dyn Statser>,
        ) {
            self.published
                .lock()
                .unwrap()
                .push((name.to_string(), value));
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                fail(&Error::Network("写入被拒绝".into()));
            }
        }
    }

    const PERIOD: Duration = Duration::from_secs(1000);
    const BACKOFF: Duration = Duration::from_secs(5);

    fn puller(
        source: &Arc<ScriptedSource>,
        statser: &Arc<FeedStatser>,
        semaphore: &Arc<Semaphore>,
    ) -> Puller<ScriptedSource> {
        Puller::new(
            "feed1",
            source.clone(),
            statser.clone(),
            semaphore.clone(),
            PERIOD,
            BACKOFF,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_publishes_to_every_publisher() {
        let source = Arc::new(ScriptedSource::default());
        let statser = Arc::new(FeedStatser::new("feed1"));
        let first = Arc::new(RecordingPublisher::default());
        let second = Arc::new(RecordingPublisher::default());
        let token = CancellationToken::new();

        let handle = puller(&source, &statser, &Arc::new(Semaphore::new(1)))
            .with_publisher(first.clone())
            .with_publisher(second.clone())
            .run(token.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let expected = vec![("feed1".to_string(), IpSetSpec(vec!["1.2.3.4/32".to_string()]))];
        assert_eq!(*first.published.lock().unwrap(), expected);
        assert_eq!(*second.published.lock().unwrap(), expected);
        assert!(statser.status().last_successful_sync.is_some());
        assert!(!statser.status().has_error(PULL_FAILED));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_failure_recorded_and_retried_with_backoff() {
        let source = Arc::new(ScriptedSource::failing(3));
        let statser = Arc::new(FeedStatser::new("feed1"));
        let publisher = Arc::new(RecordingPublisher::default());
        let token = CancellationToken::new();

        let _handle = puller(&source, &statser, &Arc::new(Semaphore::new(1)))
            .with_publisher(publisher.clone())
            .run(token.clone());

        // 首次失败后立即重试一次，随后每次重试间隔退避时间
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert!(statser.status().has_error(PULL_FAILED));
        assert!(publisher.published.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 4);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
        assert!(!statser.status().has_error(PULL_FAILED));

        // 成功后回到正常周期
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 4);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_reschedules_pull() {
        let source = Arc::new(ScriptedSource::default());
        let statser = Arc::new(FeedStatser::new("feed1"));
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.failures.store(1, Ordering::SeqCst);
        let token = CancellationToken::new();

        let _handle = puller(&source, &statser, &Arc::new(Semaphore::new(1)))
            .with_publisher(publisher.clone())
            .run(token.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.published.lock().unwrap().len(), 2);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_semaphore_limits_concurrent_pulls() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_secs(10),
            ..ScriptedSource::default()
        });
        let statser = Arc::new(FeedStatser::new("feed1"));
        let semaphore = Arc::new(Semaphore::new(1));
        let token = CancellationToken::new();

        let _a = puller(&source, &statser, &semaphore).run(token.clone());
        let _b = puller(&source, &statser, &semaphore).run(token.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_puller() {
        let source = Arc::new(ScriptedSource::default());
        let statser = Arc::new(FeedStatser::new("feed1"));
        let token = CancellationToken::new();

        let handle = puller(&source, &statser, &Arc::new(Semaphore::new(1))).run(token.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        handle.await.unwrap();

        tokio::time::sleep(PERIOD * 2).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }
}
