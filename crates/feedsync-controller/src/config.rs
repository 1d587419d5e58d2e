//! 配置管理模块
//!
//! 该模块负责加载控制器配置，支持 YAML/JSON 格式的配置文件，
//! 未指定的字段使用内置默认值，并允许通过 `FEEDSYNC_` 前缀的环境变量覆盖
//! （层级之间使用 `__` 分隔，例如 `FEEDSYNC_ELASTIC__URL`）。

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::reconciler::{DEFAULT_CLIENT_RETRIES, DEFAULT_RECONCILE_PERIOD_SECS, DEFAULT_UPDATE_QUEUE_LEN};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "FEEDSYNC";

/// 控制器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// 日志级别
    pub log_level: String,
    /// Elasticsearch 配置
    pub elastic: ElasticConfig,
    /// 协调配置
    pub reconcile: ReconcileConfig,
    /// 拉取配置
    pub pull: PullConfig,
}

/// Elasticsearch 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    /// 集群地址
    pub url: String,
    /// 用户名
    pub username: Option<String>,
    /// 密码
    pub password: Option<String>,
    /// 集群名称，作为索引名后缀
    pub cluster_name: String,
    /// 索引主分片数
    pub index_shards: u32,
    /// 索引副本数
    pub index_replicas: u32,
}

/// 协调配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// 协调周期（秒）
    pub period_seconds: u64,
    /// 更新队列容量
    pub queue_capacity: usize,
    /// Kubernetes 客户端重试次数
    pub client_retries: u32,
}

/// 拉取配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// 同时进行的拉取数量上限
    pub max_concurrent: usize,
    /// 威胁源未指定周期时的默认拉取周期（秒）
    pub default_period_seconds: u64,
    /// 重新调度后的退避时间（秒）
    pub retry_backoff_seconds: u64,
    /// 单次拉取超时（秒）
    pub timeout_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            elastic: ElasticConfig::default(),
            reconcile: ReconcileConfig::default(),
            pull: PullConfig::default(),
        }
    }
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            cluster_name: "cluster".to_string(),
            index_shards: 1,
            index_replicas: 0,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            period_seconds: DEFAULT_RECONCILE_PERIOD_SECS,
            queue_capacity: DEFAULT_UPDATE_QUEUE_LEN,
            client_retries: DEFAULT_CLIENT_RETRIES,
        }
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            default_period_seconds: 86400,
            retry_backoff_seconds: 30,
            timeout_seconds: 60,
        }
    }
}

impl ReconcileConfig {
    /// 协调周期
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds)
    }
}

impl PullConfig {
    /// 默认拉取周期
    pub fn default_period(&self) -> Duration {
        Duration::from_secs(self.default_period_seconds)
    }

    /// 重新调度退避时间
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_seconds)
    }

    /// 单次拉取超时
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl ControllerConfig {
    /// 加载配置
    ///
    /// `path` 为空时只使用默认值与环境变量。
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::build(path, Environment::with_prefix(ENV_PREFIX))
    }

    /// 使用给定的环境变量集合加载配置
    pub fn load_with_env(path: Option<&Path>, env: HashMap<String, String>) -> Result<Self> {
        Self::build(path, Environment::with_prefix(ENV_PREFIX).source(Some(env)))
    }

    fn build(path: Option<&Path>, env: Environment) -> Result<Self> {
        let defaults = Config::try_from(&ControllerConfig::default()).context("构建默认配置失败")?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            let config_file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;

            // 确定配置文件格式
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => bail!("不支持的配置文件格式，仅支持 YAML 或 JSON: {:?}", path),
            };
            debug!(path = %config_file, "加载配置文件");
            builder = builder.add_source(File::with_name(config_file).format(format));
        }

        let config = builder
            .add_source(env.prefix_separator("_").separator("__").try_parsing(true))
            .build()
            .context("构建配置失败")?;

        let controller_config = config
            .try_deserialize::<ControllerConfig>()
            .context("配置格式错误")?;
        controller_config.validate()?;

        Ok(controller_config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.elastic.url)
            .with_context(|| format!("Elasticsearch 地址无效: {}", self.elastic.url))?;
        if self.elastic.cluster_name.is_empty() {
            bail!("集群名称不能为空");
        }
        if self.reconcile.period_seconds == 0 {
            bail!("协调周期必须大于 0");
        }
        if self.reconcile.queue_capacity == 0 {
            bail!("更新队列容量必须大于 0");
        }
        if self.pull.max_concurrent == 0 {
            bail!("拉取并发数必须大于 0");
        }
        if self.pull.default_period_seconds == 0 {
            bail!("默认拉取周期必须大于 0");
        }
        if self.pull.timeout_seconds == 0 {
            bail!("拉取超时必须大于 0");
        }
        Ok(())
    }
}
