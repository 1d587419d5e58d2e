//! 控制器模块
//!
//! 该模块组装 FeedSync Operator：创建 Elasticsearch 集合协调器、GlobalNetworkSet
//! 协调器和威胁源监听器，并在取消令牌触发前持续运行。

use std::sync::Arc;

use anyhow::{Context, Result};
use feedsync_common::{DomainNameSetSpec, IpSetSpec};
use feedsync_controller::elastic::{DomainNameSetBackend, ElasticClient, IpSetBackend};
use feedsync_controller::{ControllerConfig, Reconciler, SetReconciler};
use kube::Client;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::crd::GlobalNetworkSet;
use crate::feed_watcher::{feed_events, FeedWatcher};
use crate::gns::GlobalNetworkSetController;
use crate::status_writer::KubeStatusWriter;

/// Operator 主结构体
pub struct Operator {
    /// Kubernetes 客户端
    client: Client,
    /// 控制器配置
    config: ControllerConfig,
}

impl Operator {
    /// 创建新的 Operator 实例
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self { client, config }
    }

    /// 运行 Operator，直到 `token` 被取消
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let elastic = ElasticClient::new(&self.config.elastic)
            .context("无法创建 Elasticsearch 客户端")?;
        let reconcile = &self.config.reconcile;

        let ip_sets: Arc<dyn Reconciler<Payload = IpSetSpec>> = Arc::new(SetReconciler::new(
            Arc::new(IpSetBackend::new(elastic.clone(), &self.config.elastic)),
            reconcile.period(),
            reconcile.queue_capacity,
        ));
        let domain_sets: Arc<dyn Reconciler<Payload = DomainNameSetSpec>> =
            Arc::new(SetReconciler::new(
                Arc::new(DomainNameSetBackend::new(elastic, &self.config.elastic)),
                reconcile.period(),
                reconcile.queue_capacity,
            ));
        let gns: Arc<dyn Reconciler<Payload = GlobalNetworkSet>> =
            Arc::new(GlobalNetworkSetController::from_client(
                self.client.clone(),
                reconcile.client_retries,
                reconcile.queue_capacity,
            ));

        ip_sets.run(token.child_token());
        domain_sets.run(token.child_token());
        gns.run(token.child_token());

        let watcher = FeedWatcher::new(
            ip_sets,
            domain_sets,
            gns,
            Arc::new(KubeStatusWriter::new(self.client.clone())),
            Arc::new(Semaphore::new(self.config.pull.max_concurrent)),
            self.config.pull.clone(),
        );

        info!(
            elastic = %self.config.elastic.url,
            cluster = %self.config.elastic.cluster_name,
            "FeedSync Operator 已启动"
        );
        watcher.run(feed_events(self.client), token).await;
        info!("FeedSync Operator 已停止");
        Ok(())
    }
}
