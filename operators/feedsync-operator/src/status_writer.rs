//! 威胁源状态写回
//!
//! 通过 status 子资源的合并补丁把 [`FeedStatus`] 写回 GlobalThreatFeed。

use async_trait::async_trait;
use feedsync_common::{FeedStatus, Result};
use feedsync_controller::status::StatusWriter;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

use crate::crd::{GlobalThreatFeed, GlobalThreatFeedStatus};
use crate::gns::kube_error;

/// 基于 Kubernetes API 的状态写回器
pub struct KubeStatusWriter {
    api: Api<GlobalThreatFeed>,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

/// 状态合并补丁
fn status_patch(status: &FeedStatus) -> serde_json::Value {
    json!({ "status": GlobalThreatFeedStatus::from(status) })
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write_status(&self, name: &str, status: &FeedStatus) -> Result<()> {
        debug!(name = %name, "写回威胁源状态");
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(status_patch(status)))
            .await
            .map_err(kube_error)?;
        Ok(())
    }
}
