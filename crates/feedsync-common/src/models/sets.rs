//! 集合模型
//!
//! 威胁源拉取得到的 IP 集合与域名集合，以及后端列举时返回的对象元数据。

use serde::{Deserialize, Serialize};

/// IP 集合内容，每一项为 CIDR 形式的网段
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpSetSpec(pub Vec<String>);

/// 域名集合内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainNameSetSpec(pub Vec<String>);

/// 后端对象元数据
///
/// `seq_no` 与 `primary_term` 用于 Elasticsearch 的乐观并发删除，
/// 在未知时为 `None`，此时删除不附带版本条件。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// 对象名称
    pub name: String,
    /// 文档序列号
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_no: Option<i64>,
    /// 主分片任期
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_term: Option<i64>,
}

impl Meta {
    /// 创建不带版本信息的元数据
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seq_no: None,
            primary_term: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_set_serializes_as_array() {
        let set = IpSetSpec(vec!["1.2.3.4/32".to_string(), "10.0.0.0/8".to_string()]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["1.2.3.4/32","10.0.0.0/8"]"#);
    }

    #[test]
    fn test_meta_skips_unknown_tokens() {
        let json = serde_json::to_value(Meta::new("feed1")).unwrap();
        assert_eq!(json, serde_json::json!({ "name": "feed1" }));
    }
}
