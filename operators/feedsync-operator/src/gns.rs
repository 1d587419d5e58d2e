//! GlobalNetworkSet 控制器
//!
//! 基于 informer 与限速工作队列的协调器。watch 事件维护本地缓存并把对象名
//! 放入工作队列；唯一的工作任务逐个取出对象名，比较期望对象与缓存中的对象，
//! 再调用 Create/Update/Delete。每个对象的 API 调用最多重试
//! `retries` 次，耗尽后调用失败回调、记录错误条件并丢弃该对象。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use feedsync_common::{
    Error, Result, Statser, GARBAGE_COLLECTION_FAILED, GLOBAL_NETWORK_SET_SYNC_FAILED,
};
use feedsync_controller::reconciler::{send_intent, FailFn, Reconciler, DEFAULT_UPDATE_QUEUE_LEN};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::{creator_selector, GlobalNetworkSet, CREATOR_LABEL, CREATOR_VALUE};
use crate::workqueue::RateLimitingQueue;

/// GlobalNetworkSet watch 事件流
pub type GnsEventStream = BoxStream<'static, watcher::Result<watcher::Event<GlobalNetworkSet>>>;

/// GlobalNetworkSet API 客户端
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GnsClient: Send + Sync + 'static {
    /// 创建对象
    async fn create(&self, gns: &GlobalNetworkSet) -> Result<()>;

    /// 替换对象，`gns` 需要携带缓存中的 resourceVersion
    async fn update(&self, gns: &GlobalNetworkSet) -> Result<()>;

    /// 删除对象，对象不存在时视为成功
    async fn delete(&self, name: &str) -> Result<()>;
}

/// 基于 kube-rs 的客户端
pub struct KubeGnsClient {
    api: Api<GlobalNetworkSet>,
}

impl KubeGnsClient {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

pub(crate) fn kube_error(err: kube::Error) -> Error {
    Error::Kube(err.to_string())
}

#[async_trait]
impl GnsClient for KubeGnsClient {
    async fn create(&self, gns: &GlobalNetworkSet) -> Result<()> {
        self.api
            .create(&PostParams::default(), gns)
            .await
            .map(|_| ())
            .map_err(kube_error)
    }

    async fn update(&self, gns: &GlobalNetworkSet) -> Result<()> {
        self.api
            .replace(&gns.name_any(), &PostParams::default(), gns)
            .await
            .map(|_| ())
            .map_err(kube_error)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(name = %name, "GlobalNetworkSet 已不存在");
                Ok(())
            }
            Err(err) => Err(kube_error(err)),
        }
    }
}

/// 发送给工作任务的意图
enum Intent {
    Add {
        gns: GlobalNetworkSet,
        fail: FailFn,
        statser: Arc<dyn Statser>,
    },
    Delete(String),
    NoGc(String),
    StartReconciliation,
}

/// GlobalNetworkSet 控制器
pub struct GlobalNetworkSetController<C: GnsClient> {
    client: Arc<C>,
    retries: u32,
    tx: mpsc::Sender<Intent>,
    /// 由 `run` 取走的意图接收端与事件流
    parts: Mutex<Option<(mpsc::Receiver<Intent>, GnsEventStream)>>,
}

impl GlobalNetworkSetController<KubeGnsClient> {
    /// 使用 Kubernetes 客户端创建，只 watch 控制器创建的对象
    pub fn from_client(client: Client, retries: u32, queue_len: usize) -> Self {
        let api: Api<GlobalNetworkSet> = Api::all(client.clone());
        let events = watcher(api, watcher::Config::default().labels(&creator_selector()))
            .default_backoff()
            .boxed();
        Self::new(Arc::new(KubeGnsClient::new(client)), events, retries, queue_len)
    }
}

impl<C: GnsClient> GlobalNetworkSetController<C> {
    /// 创建新的控制器
    pub fn new(client: Arc<C>, events: GnsEventStream, retries: u32, queue_len: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        Self {
            client,
            retries,
            tx,
            parts: Mutex::new(Some((rx, events))),
        }
    }

    /// 使用默认队列容量创建
    pub fn with_defaults(client: Arc<C>, events: GnsEventStream, retries: u32) -> Self {
        Self::new(client, events, retries, DEFAULT_UPDATE_QUEUE_LEN)
    }
}

#[async_trait]
impl<C: GnsClient> Reconciler for GlobalNetworkSetController<C> {
    type Payload = GlobalNetworkSet;

    async fn add(
        &self,
        ctx: &CancellationToken,
        name: &str,
        mut value: GlobalNetworkSet,
        fail: FailFn,
        statser: Arc<dyn Statser>,
    ) {
        value.metadata.name = Some(name.to_string());
        value
            .labels_mut()
            .insert(CREATOR_LABEL.to_string(), CREATOR_VALUE.to_string());
        let intent = Intent::Add {
            gns: value,
            fail,
            statser,
        };
        send_intent(&self.tx, ctx, intent).await;
    }

    async fn delete(&self, ctx: &CancellationToken, name: &str) {
        send_intent(&self.tx, ctx, Intent::Delete(name.to_string())).await;
    }

    async fn no_gc(&self, ctx: &CancellationToken, name: &str) {
        send_intent(&self.tx, ctx, Intent::NoGc(name.to_string())).await;
    }

    async fn start_reconciliation(&self, ctx: &CancellationToken) {
        send_intent(&self.tx, ctx, Intent::StartReconciliation).await;
    }

    fn run(&self, shutdown: CancellationToken) {
        let parts = self.parts.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some((rx, events)) = parts else {
            debug!("GlobalNetworkSet 控制器已在运行");
            return;
        };

        let worker = Worker::new(self.client.clone(), self.retries);
        tokio::spawn(worker.run(rx, events, shutdown));
    }
}

/// 期望写入的对象
struct Desired {
    gns: GlobalNetworkSet,
    fail: FailFn,
    statser: Arc<dyn Statser>,
}

/// 一次处理决定的 API 调用
enum Action {
    Create(GlobalNetworkSet),
    Update(GlobalNetworkSet),
    Delete,
}

struct Worker<C: GnsClient> {
    client: Arc<C>,
    retries: u32,
    /// 本地缓存
    cache: Writer<GlobalNetworkSet>,
    store: Store<GlobalNetworkSet>,
    desired: HashMap<String, Desired>,
    retained: HashSet<String>,
    /// 每个对象最近一次关联的状态上报器，用于报告回收失败
    sinks: HashMap<String, Arc<dyn Statser>>,
    queue: RateLimitingQueue<String>,
    /// 是否已经结束预热
    started: bool,
}

impl<C: GnsClient> Worker<C> {
    fn new(client: Arc<C>, retries: u32) -> Self {
        let writer = Writer::default();
        Self {
            client,
            retries,
            store: writer.as_reader(),
            cache: writer,
            desired: HashMap::new(),
            retained: HashSet::new(),
            sinks: HashMap::new(),
            queue: RateLimitingQueue::default(),
            started: false,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Intent>,
        mut events: GnsEventStream,
        token: CancellationToken,
    ) {
        let mut watching = true;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                intent = rx.recv() => match intent {
                    Some(intent) => self.apply(intent),
                    None => return,
                },
                event = events.next(), if watching => match event {
                    Some(Ok(event)) => self.observe(event),
                    Some(Err(err)) => warn!(error = %err, "GlobalNetworkSet watch 出错"),
                    None => {
                        warn!("GlobalNetworkSet watch 已结束");
                        watching = false;
                    }
                },
                key = self.queue.next(), if self.started => {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = self.process(key) => {}
                    }
                }
            }
        }
    }

    fn apply(&mut self, intent: Intent) {
        match intent {
            Intent::Add { gns, fail, statser } => {
                let name = gns.name_any();
                self.sinks.insert(name.clone(), statser.clone());
                self.desired.insert(name.clone(), Desired { gns, fail, statser });
                self.queue.add(name);
            }
            Intent::Delete(name) => {
                self.desired.remove(&name);
                self.retained.remove(&name);
                self.queue.add(name);
            }
            Intent::NoGc(name) => {
                self.retained.insert(name);
            }
            Intent::StartReconciliation => {
                if !self.started {
                    info!(
                        desired = self.desired.len(),
                        retained = self.retained.len(),
                        "开始协调 GlobalNetworkSet"
                    );
                }
                self.started = true;
            }
        }
    }

    fn observe(&mut self, event: watcher::Event<GlobalNetworkSet>) {
        self.cache.apply_watcher_event(&event);
        match event {
            watcher::Event::Applied(gns) | watcher::Event::Deleted(gns) => {
                self.queue.add(gns.name_any());
            }
            watcher::Event::Restarted(list) => {
                // 重新列举后，缓存中的对象与期望对象都需要重新检查
                debug!(count = list.len(), "GlobalNetworkSet 缓存已重新同步");
                for gns in &list {
                    self.queue.add(gns.name_any());
                }
                let desired: Vec<String> = self.desired.keys().cloned().collect();
                for name in desired {
                    self.queue.add(name);
                }
            }
        }
    }

    /// 比较期望状态与缓存，决定需要的 API 调用
    fn plan(&self, key: &str) -> Option<Action> {
        let cached = self.store.get(&ObjectRef::new(key));
        match (self.desired.get(key), cached) {
            (Some(desired), None) => Some(Action::Create(desired.gns.clone())),
            (Some(desired), Some(observed)) => {
                if observed.spec == desired.gns.spec && labels(&observed) == labels(&desired.gns) {
                    return None;
                }
                let mut gns = desired.gns.clone();
                gns.metadata.resource_version = observed.metadata.resource_version.clone();
                Some(Action::Update(gns))
            }
            (None, Some(observed)) => {
                if is_owned(&observed) && !self.retained.contains(key) {
                    Some(Action::Delete)
                } else {
                    None
                }
            }
            (None, None) => None,
        }
    }

    async fn process(&mut self, key: String) {
        let Some(action) = self.plan(&key) else {
            self.queue.forget(&key);
            match self.desired.get(&key) {
                Some(desired) => desired.statser.clear_error(GLOBAL_NETWORK_SET_SYNC_FAILED),
                // 既不期望也不保留，且无需删除，不再需要上报器
                None if !self.retained.contains(&key) => {
                    self.sinks.remove(&key);
                }
                None => {}
            }
            return;
        };

        let is_delete = matches!(action, Action::Delete);
        let result = match action {
            Action::Create(gns) => {
                debug!(name = %key, "创建 GlobalNetworkSet");
                self.client.create(&gns).await
            }
            Action::Update(gns) => {
                debug!(name = %key, "更新 GlobalNetworkSet");
                self.client.update(&gns).await
            }
            Action::Delete => {
                info!(name = %key, "删除 GlobalNetworkSet");
                self.client.delete(&key).await
            }
        };

        match result {
            Ok(()) => self.succeeded(&key, is_delete),
            Err(err) if self.queue.num_requeues(&key) < self.retries => {
                warn!(name = %key, error = %err, "GlobalNetworkSet 同步失败，稍后重试");
                self.queue.add_rate_limited(key);
            }
            Err(err) => {
                error!(name = %key, error = %err, "GlobalNetworkSet 同步失败，放弃重试");
                self.queue.forget(&key);
                self.give_up(&key, is_delete, &err);
            }
        }
    }

    fn succeeded(&mut self, key: &str, is_delete: bool) {
        self.queue.forget(&key.to_string());
        if is_delete {
            if let Some(statser) = self.sinks.remove(key) {
                statser.clear_error(GARBAGE_COLLECTION_FAILED);
            }
        } else if let Some(desired) = self.desired.get(key) {
            desired.statser.clear_error(GLOBAL_NETWORK_SET_SYNC_FAILED);
        }
    }

    fn give_up(&self, key: &str, is_delete: bool, err: &Error) {
        if is_delete {
            if let Some(statser) = self.sinks.get(key) {
                statser.error(GARBAGE_COLLECTION_FAILED, err);
            }
        } else if let Some(desired) = self.desired.get(key) {
            (desired.fail)(err);
            desired.statser.error(GLOBAL_NETWORK_SET_SYNC_FAILED, err);
        }
    }
}

fn labels(gns: &GlobalNetworkSet) -> BTreeMap<String, String> {
    gns.metadata.labels.clone().unwrap_or_default()
}

fn is_owned(gns: &GlobalNetworkSet) -> bool {
    gns.labels().get(CREATOR_LABEL).map(String::as_str) == Some(CREATOR_VALUE)
}
