//! 集合协调器
//!
//! 基于通道的期望状态协调器。调用方通过有界通道发送意图，唯一的属主任务
//! 维护“脏”对象（待写入）与“保留”对象（免于回收）两组状态，并按固定周期：
//!
//! 1. 列举后端中的对象；
//! 2. 回收既不脏也不保留的孤立对象；
//! 3. 写入所有脏对象，成功后转入保留集合。
//!
//! 两组状态只由属主任务读写，因此不需要任何锁。写入失败的对象保持为脏，
//! 在下一轮协调中继续重试，没有次数上限。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use feedsync_common::{Meta, Statser, GARBAGE_COLLECTION_FAILED};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::SetBackend;
use crate::runloop::ticker;
use crate::reconciler::{send_intent, FailFn, Reconciler};

/// 待写入的对象
struct Pending<P> {
    name: String,
    value: P,
    fail: FailFn,
    statser: Arc<dyn Statser>,
}

/// 发送给属主任务的意图
enum Update<P> {
    Add(Pending<P>),
    Delete(String),
    NoGc(String),
    StartReconciliation,
}

/// 基于通道的集合协调器
pub struct SetReconciler<B: SetBackend> {
    /// 后端
    backend: Arc<B>,
    /// 协调周期
    period: Duration,
    /// 意图通道发送端
    tx: mpsc::Sender<Update<B::Payload>>,
    /// 意图通道接收端，由 `run` 取走
    rx: Mutex<Option<mpsc::Receiver<Update<B::Payload>>>>,
}

impl<B: SetBackend> SetReconciler<B> {
    /// 创建新的集合协调器
    pub fn new(backend: Arc<B>, period: Duration, queue_len: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        Self {
            backend,
            period,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl<B: SetBackend> Reconciler for SetReconciler<B> {
    type Payload = B::Payload;

    async fn add(
        &self,
        ctx: &CancellationToken,
        name: &str,
        value: B::Payload,
        fail: FailFn,
        statser: Arc<dyn Statser>,
    ) {
        let pending = Pending {
            name: name.to_string(),
            value,
            fail,
            statser,
        };
        send_intent(&self.tx, ctx, Update::Add(pending)).await;
    }

    async fn delete(&self, ctx: &CancellationToken, name: &str) {
        send_intent(&self.tx, ctx, Update::Delete(name.to_string())).await;
    }

    async fn no_gc(&self, ctx: &CancellationToken, name: &str) {
        send_intent(&self.tx, ctx, Update::NoGc(name.to_string())).await;
    }

    async fn start_reconciliation(&self, ctx: &CancellationToken) {
        send_intent(&self.tx, ctx, Update::StartReconciliation).await;
    }

    fn run(&self, shutdown: CancellationToken) {
        let rx = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(rx) = rx else {
            debug!("集合协调器已在运行");
            return;
        };

        let actor = SetActor {
            backend: self.backend.clone(),
            dirty: HashMap::new(),
            retained: HashSet::new(),
            sinks: HashMap::new(),
        };
        tokio::spawn(actor.run(rx, self.period, shutdown));
    }
}

/// 属主任务状态
struct SetActor<B: SetBackend> {
    backend: Arc<B>,
    /// 待写入的对象
    dirty: HashMap<String, Pending<B::Payload>>,
    /// 免于回收的对象
    retained: HashSet<String>,
    /// 每个对象最近一次关联的状态上报器，用于报告回收失败
    sinks: HashMap<String, Arc<dyn Statser>>,
}

impl<B: SetBackend> SetActor<B> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Update<B::Payload>>,
        period: Duration,
        token: CancellationToken,
    ) {
        // 预热阶段：只应用意图，不触碰后端
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                update = rx.recv() => match update {
                    None => return,
                    Some(Update::StartReconciliation) => break,
                    Some(update) => self.apply(update),
                }
            }
        }

        info!(
            dirty = self.dirty.len(),
            retained = self.retained.len(),
            "开始周期性协调"
        );

        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                update = rx.recv() => match update {
                    None => return,
                    Some(update) => self.apply(update),
                },
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = self.reconcile() => {}
                    }
                }
            }
        }
    }

    fn apply(&mut self, update: Update<B::Payload>) {
        match update {
            Update::Add(pending) => {
                self.sinks
                    .insert(pending.name.clone(), pending.statser.clone());
                self.dirty.insert(pending.name.clone(), pending);
            }
            Update::Delete(name) => {
                self.dirty.remove(&name);
                self.retained.remove(&name);
            }
            Update::NoGc(name) => {
                self.retained.insert(name);
            }
            Update::StartReconciliation => {
                debug!("协调已经开始，忽略重复的开始请求");
            }
        }
    }

    async fn reconcile(&mut self) {
        let metas = match self.backend.list().await {
            Ok(metas) => metas,
            Err(err) => {
                error!(error = %err, "列举后端对象失败，跳过本轮协调");
                for pending in self.dirty.values() {
                    pending.statser.error(B::SYNC_FAILURE, &err);
                }
                return;
            }
        };

        let mut attempted = HashSet::new();
        let mut listed = HashSet::new();
        for meta in &metas {
            listed.insert(meta.name.clone());
            if self.dirty.contains_key(&meta.name) {
                self.write(&meta.name).await;
                attempted.insert(meta.name.clone());
            } else if !self.retained.contains(&meta.name) {
                self.collect_garbage(meta).await;
            }
        }

        let remaining: Vec<String> = self
            .dirty
            .keys()
            .filter(|name| !attempted.contains(*name))
            .cloned()
            .collect();
        for name in remaining {
            self.write(&name).await;
        }

        let (dirty, retained) = (&self.dirty, &self.retained);
        self.sinks.retain(|name, _| {
            dirty.contains_key(name) || retained.contains(name) || listed.contains(name)
        });
    }

    async fn write(&mut self, name: &str) {
        let Some(pending) = self.dirty.get(name) else {
            return;
        };

        match self.backend.put(name, &pending.value).await {
            Ok(()) => {
                debug!(name = %name, "对象写入成功");
                pending.statser.clear_error(B::SYNC_FAILURE);
                self.dirty.remove(name);
                self.retained.insert(name.to_string());
            }
            Err(err) => {
                warn!(name = %name, error = %err, "对象写入失败，下一轮协调时重试");
                (pending.fail)(&err);
                pending.statser.error(B::SYNC_FAILURE, &err);
            }
        }
    }

    async fn collect_garbage(&mut self, meta: &Meta) {
        match self.backend.delete(meta).await {
            Ok(()) => {
                info!(name = %meta.name, "已回收孤立对象");
                if let Some(statser) = self.sinks.remove(&meta.name) {
                    statser.clear_error(GARBAGE_COLLECTION_FAILED);
                }
            }
            Err(err) if err.is_not_found() => {
                debug!(name = %meta.name, "孤立对象已不存在");
                self.sinks.remove(&meta.name);
            }
            Err(err) => {
                error!(name = %meta.name, error = %err, "回收孤立对象失败");
                if let Some(statser) = self.sinks.get(&meta.name) {
                    statser.error(GARBAGE_COLLECTION_FAILED, &err);
                }
            }
        }
    }
}
