//! HTTP 威胁源
//!
//! 通过 HTTP GET 拉取按行组织的威胁情报列表。空行与 `#` 开头的注释行被忽略，
//! 无法解析的行记录警告后跳过，不会导致整次拉取失败。

use std::marker::PhantomData;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use feedsync_common::{DomainNameSetSpec, Error, IpSetSpec, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::puller::FeedSource;

/// 威胁源文本格式
pub trait FeedFormat: Clone + Send + Sync + 'static {
    /// 解析完整的响应体
    fn parse(body: &str) -> Self;
}

impl FeedFormat for IpSetSpec {
    fn parse(body: &str) -> Self {
        IpSetSpec(feed_lines(body).filter_map(parse_ip_line).collect())
    }
}

impl FeedFormat for DomainNameSetSpec {
    fn parse(body: &str) -> Self {
        DomainNameSetSpec(feed_lines(body).filter_map(parse_domain_line).collect())
    }
}

/// 去除空行与注释行
fn feed_lines(body: &str) -> impl Iterator<Item = &str> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// 取行首的 IP 或 CIDR，单个地址补全为 `/32` 或 `/128`
fn parse_ip_line(line: &str) -> Option<String> {
    let token = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .next()
        .unwrap_or_default();

    let parsed = match token.split_once('/') {
        Some((addr, prefix)) => addr.parse::<IpAddr>().ok().and_then(|ip| {
            let max = if ip.is_ipv4() { 32 } else { 128 };
            prefix
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .map(|p| format!("{}/{}", ip, p))
        }),
        None => token.parse::<IpAddr>().ok().map(|ip| match ip {
            IpAddr::V4(ip) => format!("{}/32", ip),
            IpAddr::V6(ip) => format!("{}/128", ip),
        }),
    };

    if parsed.is_none() {
        warn!(line = %line, "无法解析的 IP 行，已跳过");
    }
    parsed
}

/// 域名统一转为小写并去除末尾的点
fn parse_domain_line(line: &str) -> Option<String> {
    if line.contains(char::is_whitespace) {
        warn!(line = %line, "无法解析的域名行，已跳过");
        return None;
    }
    let domain = line.trim_end_matches('.').to_lowercase();
    if domain.is_empty() {
        return None;
    }
    Some(domain)
}

/// 基于 HTTP 的威胁源
pub struct HttpSource<S> {
    client: Client,
    url: Url,
    headers: HeaderMap,
    _marker: PhantomData<fn() -> S>,
}

impl<S: FeedFormat> HttpSource<S> {
    /// 创建新的 HTTP 威胁源
    pub fn new(url: Url, headers: &[(String, String)], timeout: Duration) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("请求头名称无效 {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("请求头 {} 的值无效: {}", name, e)))?;
            header_map.append(name, value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self {
            client,
            url,
            headers: header_map,
            _marker: PhantomData,
        })
    }
}

#[async_trait]
impl<S: FeedFormat> FeedSource for HttpSource<S> {
    type Payload = S;

    async fn fetch(&self) -> Result<S> {
        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("拉取 {} 返回 HTTP {}", self.url, status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let set = S::parse(&body);
        debug!(url = %self.url, bytes = body.len(), "威胁源拉取完成");
        Ok(set)
    }
}
