//! 威胁源监听模块
//!
//! 该模块监听 GlobalThreatFeed 资源，为每个威胁源启动拉取器与状态写回任务，
//! 并在威胁源变化或删除时驱动各个协调器。
//!
//! 第一次列举完成前协调器处于预热阶段：所有已存在的威胁源先被标记为保留，
//! 之后才发送 `start_reconciliation`，避免误删仍然有效的对象。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use feedsync_common::{DomainNameSetSpec, Error, FeedStatus, IpSetSpec, Statser, PULL_FAILED};
use feedsync_controller::config::PullConfig;
use feedsync_controller::http::{FeedFormat, HttpSource};
use feedsync_controller::puller::{Publisher, Puller, ReconcilerPublisher};
use feedsync_controller::reconciler::{FailFn, Reconciler};
use feedsync_controller::status::{FeedStatser, StatusWriter};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::crd::{
    gns_name, parse_period, GlobalNetworkSet, GlobalNetworkSetSpec, GlobalThreatFeed,
    GlobalThreatFeedSpec, ThreatFeedContent,
};

/// GlobalThreatFeed watch 事件流
pub type FeedEventStream = BoxStream<'static, watcher::Result<watcher::Event<GlobalThreatFeed>>>;

/// 创建 GlobalThreatFeed watch 事件流
pub fn feed_events(client: Client) -> FeedEventStream {
    let api: Api<GlobalThreatFeed> = Api::all(client);
    watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed()
}

/// 把 IP 集合发布为 GlobalNetworkSet
pub struct GnsPublisher {
    gns: Arc<dyn Reconciler<Payload = GlobalNetworkSet>>,
    labels: BTreeMap<String, String>,
}

impl GnsPublisher {
    pub fn new(
        gns: Arc<dyn Reconciler<Payload = GlobalNetworkSet>>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self { gns, labels }
    }
}

#[async_trait]
impl Publisher<IpSetSpec> for GnsPublisher {
    async fn publish(
        &self,
        ctx: &CancellationToken,
        name: &str,
        value: IpSetSpec,
        fail: FailFn,
        statser: Arc<dyn Statser>,
    ) {
        let name = gns_name(name);
        let mut gns = GlobalNetworkSet::new(
            &name,
            GlobalNetworkSetSpec {
                nets: value.0,
                allowed_egress_domains: Vec::new(),
            },
        );
        gns.metadata.labels = Some(self.labels.clone());
        self.gns.add(ctx, &name, gns, fail, statser).await;
    }
}

/// 单个威胁源的运行状态
struct FeedState {
    spec: GlobalThreatFeedSpec,
    statser: Arc<FeedStatser>,
    /// 威胁源的生命周期，取消后停止状态写回与拉取
    feed_token: CancellationToken,
    /// 当前拉取器的生命周期
    puller_token: CancellationToken,
    /// 拉取器启动次数
    generation: u64,
}

/// 威胁源监听器
pub struct FeedWatcher {
    ip_sets: Arc<dyn Reconciler<Payload = IpSetSpec>>,
    domain_sets: Arc<dyn Reconciler<Payload = DomainNameSetSpec>>,
    gns: Arc<dyn Reconciler<Payload = GlobalNetworkSet>>,
    status_writer: Arc<dyn StatusWriter>,
    semaphore: Arc<Semaphore>,
    pull: PullConfig,
    feeds: HashMap<String, FeedState>,
    /// 是否已经处理过第一次列举
    initialized: bool,
}

impl FeedWatcher {
    /// 创建新的威胁源监听器
    pub fn new(
        ip_sets: Arc<dyn Reconciler<Payload = IpSetSpec>>,
        domain_sets: Arc<dyn Reconciler<Payload = DomainNameSetSpec>>,
        gns: Arc<dyn Reconciler<Payload = GlobalNetworkSet>>,
        status_writer: Arc<dyn StatusWriter>,
        semaphore: Arc<Semaphore>,
        pull: PullConfig,
    ) -> Self {
        Self {
            ip_sets,
            domain_sets,
            gns,
            status_writer,
            semaphore,
            pull,
            feeds: HashMap::new(),
            initialized: false,
        }
    }

    /// 处理事件直到 `token` 被取消或事件流结束
    pub async fn run(mut self, mut events: FeedEventStream, token: CancellationToken) {
        info!("启动 GlobalThreatFeed 监听器");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle(&token, event).await,
                    Some(Err(err)) => warn!(error = %err, "GlobalThreatFeed watch 出错"),
                    None => {
                        warn!("GlobalThreatFeed watch 已结束");
                        break;
                    }
                },
            }
        }
        info!("GlobalThreatFeed 监听器已停止");
    }

    /// 当前跟踪的威胁源状态
    pub fn feed_status(&self, name: &str) -> Option<FeedStatus> {
        self.feeds.get(name).map(|state| state.statser.status())
    }

    /// 处理一个 watch 事件
    pub async fn handle(&mut self, token: &CancellationToken, event: watcher::Event<GlobalThreatFeed>) {
        match event {
            watcher::Event::Restarted(feeds) if !self.initialized => {
                self.initial_listing(token, feeds).await;
            }
            watcher::Event::Restarted(feeds) => self.resync(token, feeds).await,
            watcher::Event::Applied(feed) => self.apply_feed(token, feed).await,
            watcher::Event::Deleted(feed) => {
                let name = feed.name_any();
                let spec = match self.feeds.get(&name) {
                    Some(state) => state.spec.clone(),
                    None => feed.spec,
                };
                self.remove_feed(token, &name, &spec).await;
            }
        }
    }

    async fn initial_listing(&mut self, token: &CancellationToken, feeds: Vec<GlobalThreatFeed>) {
        info!(count = feeds.len(), "完成 GlobalThreatFeed 初次列举");
        for feed in &feeds {
            self.retain(token, &feed.name_any(), &feed.spec).await;
        }
        for feed in feeds {
            self.track_feed(token, feed);
        }

        self.ip_sets.start_reconciliation(token).await;
        self.domain_sets.start_reconciliation(token).await;
        self.gns.start_reconciliation(token).await;
        self.initialized = true;
    }

    /// 重新列举：消失的威胁源按删除处理，其余按更新处理
    async fn resync(&mut self, token: &CancellationToken, feeds: Vec<GlobalThreatFeed>) {
        let listed: HashSet<String> = feeds.iter().map(|f| f.name_any()).collect();
        let gone: Vec<(String, GlobalThreatFeedSpec)> = self
            .feeds
            .iter()
            .filter(|(name, _)| !listed.contains(*name))
            .map(|(name, state)| (name.clone(), state.spec.clone()))
            .collect();
        for (name, spec) in gone {
            self.remove_feed(token, &name, &spec).await;
        }
        for feed in feeds {
            self.apply_feed(token, feed).await;
        }
    }

    async fn retain(&self, token: &CancellationToken, name: &str, spec: &GlobalThreatFeedSpec) {
        match spec.content {
            ThreatFeedContent::IPSet => self.ip_sets.no_gc(token, name).await,
            ThreatFeedContent::DomainNameSet => self.domain_sets.no_gc(token, name).await,
        }
        if spec.syncs_global_network_set() {
            self.gns.no_gc(token, &gns_name(name)).await;
        }
    }

    async fn apply_feed(&mut self, token: &CancellationToken, feed: GlobalThreatFeed) {
        let name = feed.name_any();
        let Some(old) = self.feeds.remove(&name) else {
            info!(name = %name, "发现新的威胁源");
            self.track_feed(token, feed);
            return;
        };

        if old.spec == feed.spec {
            // 只有状态变化，通常是自身写回状态引起的
            self.feeds.insert(name, old);
            return;
        }

        info!(name = %name, "威胁源配置已变化，重启拉取");
        old.puller_token.cancel();
        if old.spec.content != feed.spec.content {
            self.delete_set(token, &name, old.spec.content).await;
        }
        if old.spec.syncs_global_network_set() && !feed.spec.syncs_global_network_set() {
            self.gns.delete(token, &gns_name(&name)).await;
        }

        let puller_token = old.feed_token.child_token();
        self.start_puller(&name, &feed.spec, &old.statser, puller_token.clone());
        self.feeds.insert(
            name,
            FeedState {
                spec: feed.spec,
                statser: old.statser,
                feed_token: old.feed_token,
                puller_token,
                generation: old.generation + 1,
            },
        );
    }

    /// 开始跟踪一个威胁源：启动状态写回与拉取器
    fn track_feed(&mut self, token: &CancellationToken, feed: GlobalThreatFeed) {
        let name = feed.name_any();
        let status = feed.status.map(FeedStatus::from).unwrap_or_default();
        let statser = Arc::new(FeedStatser::with_status(name.clone(), status));
        let feed_token = token.child_token();
        statser.run(feed_token.clone(), self.status_writer.clone());

        let puller_token = feed_token.child_token();
        self.start_puller(&name, &feed.spec, &statser, puller_token.clone());
        self.feeds.insert(
            name,
            FeedState {
                spec: feed.spec,
                statser,
                feed_token,
                puller_token,
                generation: 1,
            },
        );
    }

    async fn remove_feed(&mut self, token: &CancellationToken, name: &str, spec: &GlobalThreatFeedSpec) {
        info!(name = %name, "威胁源已删除");
        if let Some(state) = self.feeds.remove(name) {
            state.feed_token.cancel();
        }
        self.delete_set(token, name, spec.content).await;
        if spec.syncs_global_network_set() {
            self.gns.delete(token, &gns_name(name)).await;
        }
    }

    async fn delete_set(&self, token: &CancellationToken, name: &str, content: ThreatFeedContent) {
        match content {
            ThreatFeedContent::IPSet => self.ip_sets.delete(token, name).await,
            ThreatFeedContent::DomainNameSet => self.domain_sets.delete(token, name).await,
        }
    }

    fn start_puller(
        &self,
        name: &str,
        spec: &GlobalThreatFeedSpec,
        statser: &Arc<FeedStatser>,
        token: CancellationToken,
    ) {
        let Some(pull) = &spec.pull else {
            debug!(name = %name, "威胁源没有拉取配置");
            return;
        };

        let period = match pull.period.as_deref().map(parse_period) {
            Some(Ok(period)) => period,
            Some(Err(err)) => {
                warn!(name = %name, error = %err, "拉取周期无效");
                statser.error(PULL_FAILED, &err);
                return;
            }
            None => self.pull.default_period(),
        };
        let url = match Url::parse(&pull.http.url) {
            Ok(url) => url,
            Err(err) => {
                let err = Error::Config(format!("威胁源地址无效 {}: {}", pull.http.url, err));
                warn!(name = %name, error = %err, "威胁源地址无效");
                statser.error(PULL_FAILED, &err);
                return;
            }
        };
        let headers: Vec<(String, String)> = pull
            .http
            .headers
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect();

        match spec.content {
            ThreatFeedContent::IPSet => {
                let Some(puller) = self.puller::<IpSetSpec>(name, url, &headers, period, statser) else {
                    return;
                };
                let mut puller =
                    puller.with_publisher(Arc::new(ReconcilerPublisher::new(self.ip_sets.clone())));
                if let Some(sync) = &spec.global_network_set {
                    puller = puller.with_publisher(Arc::new(GnsPublisher::new(
                        self.gns.clone(),
                        sync.labels.clone(),
                    )));
                }
                puller.run(token);
            }
            ThreatFeedContent::DomainNameSet => {
                let Some(puller) =
                    self.puller::<DomainNameSetSpec>(name, url, &headers, period, statser)
                else {
                    return;
                };
                puller
                    .with_publisher(Arc::new(ReconcilerPublisher::new(self.domain_sets.clone())))
                    .run(token);
            }
        }
    }

    fn puller<S: FeedFormat>(
        &self,
        name: &str,
        url: Url,
        headers: &[(String, String)],
        period: std::time::Duration,
        statser: &Arc<FeedStatser>,
    ) -> Option<Puller<HttpSource<S>>> {
        match HttpSource::<S>::new(url, headers, self.pull.timeout()) {
            Ok(source) => Some(Puller::new(
                name,
                Arc::new(source),
                statser.clone(),
                self.semaphore.clone(),
                period,
                self.pull.retry_backoff(),
            )),
            Err(err) => {
                warn!(name = %name, error = %err, "无法创建 HTTP 威胁源");
                statser.error(PULL_FAILED, &err);
                None
            }
        }
    }

    #[cfg(test)]
    fn generation(&self, name: &str) -> Option<u64> {
        self.feeds.get(name).map(|state| state.generation)
    }
}
