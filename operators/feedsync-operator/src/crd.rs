//! 自定义资源定义模块
//!
//! 该模块定义了 FeedSync 使用的自定义资源类型：用户创建的 GlobalThreatFeed，
//! 以及控制器为 IP 威胁源生成的 GlobalNetworkSet。

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feedsync_common::{Error, ErrorCondition, FeedStatus, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// 控制器创建的对象上的归属标签
pub const CREATOR_LABEL: &str = "feedsync.io/creator";
/// 归属标签的值
pub const CREATOR_VALUE: &str = "feedsync-controller";
/// GlobalNetworkSet 名称前缀
pub const GNS_NAME_PREFIX: &str = "threatfeed.";

/// 威胁源规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "crd.projectcalico.org", version = "v1", kind = "GlobalThreatFeed")]
#[kube(status = "GlobalThreatFeedStatus")]
#[kube(printcolumn = r#"{"name":"内容", "type":"string", "jsonPath":".spec.content"}"#)]
#[kube(printcolumn = r#"{"name":"上次同步", "type":"date", "jsonPath":".status.lastSuccessfulSync"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GlobalThreatFeedSpec {
    /// 内容类型：IPSet 或 DomainNameSet
    #[serde(default)]
    pub content: ThreatFeedContent,

    /// 拉取配置，为空时威胁源只被保留，不会被拉取
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<Pull>,

    /// GlobalNetworkSet 同步配置，仅对 IPSet 内容生效
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_network_set: Option<GlobalNetworkSetSync>,
}

/// 威胁源内容类型
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ThreatFeedContent {
    /// IP 集合
    #[default]
    IPSet,
    /// 域名集合
    DomainNameSet,
}

/// 拉取配置
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Pull {
    /// 拉取周期，例如 `24h`、`1h30m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,

    /// HTTP 拉取配置
    pub http: HttpPull,
}

/// HTTP 拉取配置
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpPull {
    /// 威胁源地址
    pub url: String,

    /// 附加请求头
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeader>,
}

/// 请求头
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct HttpHeader {
    /// 名称
    pub name: String,
    /// 值
    #[serde(default)]
    pub value: String,
}

/// GlobalNetworkSet 同步配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GlobalNetworkSetSync {
    /// 附加到生成的 GlobalNetworkSet 上的标签
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// 威胁源状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalThreatFeedStatus {
    /// 上次成功同步时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_sync: Option<DateTime<Utc>>,

    /// 当前错误条件
    #[serde(default)]
    pub error_conditions: Vec<ThreatFeedErrorCondition>,
}

/// 错误条件
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ThreatFeedErrorCondition {
    /// 条件类型
    #[serde(rename = "type")]
    pub kind: String,
    /// 错误信息
    pub message: String,
}

impl From<&FeedStatus> for GlobalThreatFeedStatus {
    fn from(status: &FeedStatus) -> Self {
        Self {
            last_successful_sync: status.last_successful_sync,
            error_conditions: status
                .error_conditions
                .iter()
                .map(|c| ThreatFeedErrorCondition {
                    kind: c.kind.clone(),
                    message: c.message.clone(),
                })
                .collect(),
        }
    }
}

impl From<GlobalThreatFeedStatus> for FeedStatus {
    fn from(status: GlobalThreatFeedStatus) -> Self {
        Self {
            last_successful_sync: status.last_successful_sync,
            error_conditions: status
                .error_conditions
                .into_iter()
                .map(|c| ErrorCondition {
                    kind: c.kind,
                    message: c.message,
                })
                .collect(),
        }
    }
}

impl GlobalThreatFeedSpec {
    /// 是否需要同步 GlobalNetworkSet
    pub fn syncs_global_network_set(&self) -> bool {
        self.content == ThreatFeedContent::IPSet && self.global_network_set.is_some()
    }
}

/// 网络集合规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "crd.projectcalico.org", version = "v1", kind = "GlobalNetworkSet")]
#[serde(rename_all = "camelCase")]
pub struct GlobalNetworkSetSpec {
    /// 网段列表
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nets: Vec<String>,

    /// 允许出站访问的域名
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_egress_domains: Vec<String>,
}

/// 威胁源对应的 GlobalNetworkSet 名称
pub fn gns_name(feed: &str) -> String {
    format!("{}{}", GNS_NAME_PREFIX, feed)
}

/// 标签选择器，只选择控制器创建的对象
pub fn creator_selector() -> String {
    format!("{}={}", CREATOR_LABEL, CREATOR_VALUE)
}

/// 解析 `1h30m`、`90s` 形式的周期
pub fn parse_period(period: &str) -> Result<Duration> {
    let invalid = || Error::Parse(format!("无效的周期: {:?}", period));

    let mut total = 0u64;
    let mut digits = String::new();
    let mut chars = period.trim().chars().peekable();
    if chars.peek().is_none() {
        return Err(invalid());
    }

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match c {
            'h' => 3600,
            's' => 1,
            'm' if chars.peek() == Some(&'s') => return Err(invalid()),
            'm' => 60,
            _ => return Err(invalid()),
        };
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }

    // 末尾缺少单位
    if !digits.is_empty() || total == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("24h", 86400)]
    #[case("1h30m", 5400)]
    #[case("90s", 90)]
    #[case(" 5m ", 300)]
    fn test_parse_period(#[case] input: &str, #[case] secs: u64) {
        assert_eq!(parse_period(input).unwrap(), Duration::from_secs(secs));
    }

    #[rstest]
    #[case("")]
    #[case("10")]
    #[case("h")]
    #[case("0s")]
    #[case("10ms")]
    #[case("1d")]
    fn test_parse_period_invalid(#[case] input: &str) {
        assert!(matches!(parse_period(input), Err(Error::Parse(_))));
    }

    #[test]
    fn test_feed_spec_deserializes() {
        let spec: GlobalThreatFeedSpec = serde_json::from_value(serde_json::json!({
            "pull": {
                "period": "12h",
                "http": {
                    "url": "https://feeds.example.com/ips.txt",
                    "headers": [{ "name": "X-Api-Key", "value": "secret" }]
                }
            },
            "globalNetworkSet": { "labels": { "threat": "botnet" } }
        }))
        .unwrap();

        assert_eq!(spec.content, ThreatFeedContent::IPSet);
        assert!(spec.syncs_global_network_set());
        let pull = spec.pull.unwrap();
        assert_eq!(pull.period.as_deref(), Some("12h"));
        assert_eq!(pull.http.headers[0].name, "X-Api-Key");
    }

    #[test]
    fn test_domain_feed_never_syncs_gns() {
        let spec = GlobalThreatFeedSpec {
            content: ThreatFeedContent::DomainNameSet,
            pull: None,
            global_network_set: Some(GlobalNetworkSetSync::default()),
        };
        assert!(!spec.syncs_global_network_set());
    }

    #[test]
    fn test_status_conversion() {
        let mut status = FeedStatus::default();
        status.set_error("PullFailed", "超时");

        let crd_status = GlobalThreatFeedStatus::from(&status);
        assert_eq!(crd_status.error_conditions[0].kind, "PullFailed");
        assert_eq!(
            serde_json::to_value(&crd_status).unwrap(),
            serde_json::to_value(&status).unwrap()
        );
        assert_eq!(FeedStatus::from(crd_status), status);
    }

    #[test]
    fn test_gns_naming() {
        assert_eq!(gns_name("feed1"), "threatfeed.feed1");
        assert_eq!(creator_selector(), "feedsync.io/creator=feedsync-controller");
    }
}
