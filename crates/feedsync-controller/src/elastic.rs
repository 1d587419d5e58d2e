//! Elasticsearch 集合后端
//!
//! 每种集合类型对应一个索引（`.feedsync.ipset.<cluster>` 与
//! `.feedsync.domainnameset.<cluster>`），每个威胁源对应索引中的一个文档，
//! 文档 ID 即威胁源名称。索引在第一次写入前按需创建。

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_common::{DomainNameSetSpec, Error, IpSetSpec, Meta, Result, ELASTIC_SYNC_FAILED};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::SetBackend;
use crate::config::ElasticConfig;

/// 滚动查询上下文保留时间
const SCROLL_KEEP_ALIVE: &str = "5m";
/// 每页文档数
const SCROLL_PAGE_SIZE: usize = 1000;
/// 请求超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Elasticsearch REST 客户端
#[derive(Clone)]
pub struct ElasticClient {
    http: Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticClient {
    /// 创建新的客户端
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("Elasticsearch 地址无效 {}: {}", config.url, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("Elasticsearch 地址无效: {}", config.url)));
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// 根据路径段构造请求地址，路径段会被正确转义
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("Elasticsearch 地址无效: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.username {
            Some(username) => builder.basic_auth(username, self.password.as_ref()),
            None => builder,
        }
    }

    /// 发送请求，非 2xx 响应转换为 [`Error::Elastic`]
    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Elastic {
            status: status.as_u16(),
            reason: error_reason(&body),
        })
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Json(e.to_string()))
    }

    /// 创建索引，索引已存在时视为成功
    pub async fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        let url = self.endpoint(&[index])?;
        match self.send(self.request(Method::PUT, url).json(body)).await {
            Ok(_) => {
                info!(index = %index, "已创建索引");
                Ok(())
            }
            Err(Error::Elastic { status, reason })
                if status == StatusCode::BAD_REQUEST.as_u16()
                    && reason.starts_with("resource_already_exists_exception") =>
            {
                debug!(index = %index, "索引已存在");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// 写入文档
    pub async fn put_document(&self, index: &str, id: &str, document: &Value) -> Result<()> {
        let url = self.endpoint(&[index, "_doc", id])?;
        self.send(self.request(Method::PUT, url).json(document))
            .await
            .map(|_| ())
    }

    /// 读取文档内容，文档或索引不存在时返回 `None`
    pub async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let url = self.endpoint(&[index, "_doc", id])?;
        match self
            .send_json::<GetResponse>(self.request(Method::GET, url))
            .await
        {
            Ok(response) if response.found => Ok(response.source),
            Ok(_) => Ok(None),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// 列举索引中所有文档的元数据，索引不存在时返回空列表
    pub async fn list_documents(&self, index: &str) -> Result<Vec<Meta>> {
        let mut url = self.endpoint(&[index, "_search"])?;
        url.query_pairs_mut().append_pair("scroll", SCROLL_KEEP_ALIVE);
        let query = json!({
            "size": SCROLL_PAGE_SIZE,
            "_source": false,
            "seq_no_primary_term": true,
            "query": { "match_all": {} },
        });

        let mut page = match self
            .send_json::<SearchResponse>(self.request(Method::POST, url).json(&query))
            .await
        {
            Ok(page) => page,
            Err(err) if err.is_not_found() => {
                debug!(index = %index, "索引不存在，视为空");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let mut metas = Vec::new();
        let mut scroll_id = page.scroll_id.take();
        let result = loop {
            if page.hits.hits.is_empty() {
                break Ok(());
            }
            metas.extend(page.hits.hits.drain(..).map(Hit::into_meta));

            let Some(id) = scroll_id.clone() else {
                break Ok(());
            };
            let url = match self.endpoint(&["_search", "scroll"]) {
                Ok(url) => url,
                Err(err) => break Err(err),
            };
            let body = json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": id });
            match self
                .send_json::<SearchResponse>(self.request(Method::POST, url).json(&body))
                .await
            {
                Ok(next) => {
                    page = next;
                    if page.scroll_id.is_some() {
                        scroll_id = page.scroll_id.take();
                    }
                }
                Err(err) => break Err(err),
            }
        };

        if let Some(id) = scroll_id {
            self.clear_scroll(&id).await;
        }
        result.map(|()| metas)
    }

    async fn clear_scroll(&self, scroll_id: &str) {
        let url = match self.endpoint(&["_search", "scroll"]) {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "清理滚动查询失败");
                return;
            }
        };
        let body = json!({ "scroll_id": [scroll_id] });
        if let Err(err) = self.send(self.request(Method::DELETE, url).json(&body)).await {
            warn!(error = %err, "清理滚动查询失败");
        }
    }

    /// 删除文档
    ///
    /// 元数据带有版本信息时附带乐观并发条件，版本冲突返回 409 错误。
    /// 文档不存在视为成功。
    pub async fn delete_document(&self, index: &str, meta: &Meta) -> Result<()> {
        let url = delete_url(self.endpoint(&[index, "_doc", meta.name.as_str()])?, meta);
        match self.send(self.request(Method::DELETE, url)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                debug!(index = %index, name = %meta.name, "文档不存在");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn delete_url(mut url: Url, meta: &Meta) -> Url {
    if let (Some(seq_no), Some(primary_term)) = (meta.seq_no, meta.primary_term) {
        url.query_pairs_mut()
            .append_pair("if_seq_no", &seq_no.to_string())
            .append_pair("if_primary_term", &primary_term.to_string());
    }
    url
}

/// 从错误响应中提取 `类型: 原因`，无法解析时返回原始响应体
fn error_reason(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ErrorDetail {
        Structured {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            reason: Option<String>,
        },
        Text(String),
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: ErrorDetail::Structured { kind, reason: Some(reason) },
        }) => format!("{}: {}", kind, reason),
        Ok(ErrorBody {
            error: ErrorDetail::Structured { kind, reason: None },
        }) => kind,
        Ok(ErrorBody {
            error: ErrorDetail::Text(text),
        }) => text,
        Err(_) => body.trim().to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_seq_no", default)]
    seq_no: Option<i64>,
    #[serde(rename = "_primary_term", default)]
    primary_term: Option<i64>,
}

impl Hit {
    fn into_meta(self) -> Meta {
        Meta {
            name: self.id,
            seq_no: self.seq_no,
            primary_term: self.primary_term,
        }
    }
}

/// 可存入 Elasticsearch 的集合类型
pub trait SetDocument: Clone + Send + Sync + 'static {
    /// 索引名前缀，完整索引名为 `<前缀>.<集群名>`
    const INDEX_PREFIX: &'static str;

    /// 索引映射
    fn mapping() -> Value;

    /// 转换为文档
    fn to_document(&self, created_at: DateTime<Utc>) -> Result<Value>;

    /// 从文档还原
    fn from_document(document: Value) -> Result<Self>;
}

#[derive(Serialize, Deserialize)]
struct IpSetDocument {
    created_at: DateTime<Utc>,
    #[serde(default)]
    ips: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct DomainNameSetDocument {
    created_at: DateTime<Utc>,
    #[serde(default)]
    domains: Vec<String>,
}

impl SetDocument for IpSetSpec {
    const INDEX_PREFIX: &'static str = ".feedsync.ipset";

    fn mapping() -> Value {
        json!({
            "properties": {
                "created_at": { "type": "date" },
                "ips": { "type": "ip_range" },
            }
        })
    }

    fn to_document(&self, created_at: DateTime<Utc>) -> Result<Value> {
        let doc = IpSetDocument {
            created_at,
            ips: self.0.clone(),
        };
        Ok(serde_json::to_value(doc)?)
    }

    fn from_document(document: Value) -> Result<Self> {
        let doc: IpSetDocument = serde_json::from_value(document)?;
        Ok(IpSetSpec(doc.ips))
    }
}

impl SetDocument for DomainNameSetSpec {
    const INDEX_PREFIX: &'static str = ".feedsync.domainnameset";

    fn mapping() -> Value {
        json!({
            "properties": {
                "created_at": { "type": "date" },
                "domains": { "type": "keyword" },
            }
        })
    }

    fn to_document(&self, created_at: DateTime<Utc>) -> Result<Value> {
        let doc = DomainNameSetDocument {
            created_at,
            domains: self.0.clone(),
        };
        Ok(serde_json::to_value(doc)?)
    }

    fn from_document(document: Value) -> Result<Self> {
        let doc: DomainNameSetDocument = serde_json::from_value(document)?;
        Ok(DomainNameSetSpec(doc.domains))
    }
}

/// 基于 Elasticsearch 的集合后端
pub struct ElasticSetBackend<S> {
    client: ElasticClient,
    index: String,
    settings: Value,
    ready: OnceCell<()>,
    _marker: PhantomData<fn() -> S>,
}

/// IP 集合后端
pub type IpSetBackend = ElasticSetBackend<IpSetSpec>;
/// 域名集合后端
pub type DomainNameSetBackend = ElasticSetBackend<DomainNameSetSpec>;

impl<S: SetDocument> ElasticSetBackend<S> {
    /// 创建新的集合后端
    pub fn new(client: ElasticClient, config: &ElasticConfig) -> Self {
        Self {
            client,
            index: index_name::<S>(&config.cluster_name),
            settings: json!({
                "number_of_shards": config.index_shards,
                "number_of_replicas": config.index_replicas,
            }),
            ready: OnceCell::new(),
            _marker: PhantomData,
        }
    }

    /// 索引名
    pub fn index(&self) -> &str {
        &self.index
    }

    /// 读取已存储的集合
    pub async fn get(&self, name: &str) -> Result<Option<S>> {
        match self.client.get_document(&self.index, name).await? {
            Some(document) => S::from_document(document).map(Some),
            None => Ok(None),
        }
    }

    async fn ensure_index(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                let body = json!({
                    "settings": self.settings,
                    "mappings": S::mapping(),
                });
                self.client.create_index(&self.index, &body).await
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<S: SetDocument> SetBackend for ElasticSetBackend<S> {
    type Payload = S;
    const SYNC_FAILURE: &'static str = ELASTIC_SYNC_FAILED;

    async fn put(&self, name: &str, value: &S) -> Result<()> {
        self.ensure_index().await?;
        let document = value.to_document(Utc::now())?;
        self.client.put_document(&self.index, name, &document).await
    }

    async fn list(&self) -> Result<Vec<Meta>> {
        self.client.list_documents(&self.index).await
    }

    async fn delete(&self, meta: &Meta) -> Result<()> {
        self.client.delete_document(&self.index, meta).await
    }
}

fn index_name<S: SetDocument>(cluster_name: &str) -> String {
    format!("{}.{}", S::INDEX_PREFIX, cluster_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn client(url: &str) -> ElasticClient {
        ElasticClient::new(&ElasticConfig {
            url: url.to_string(),
            ..ElasticConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_index_names() {
        assert_eq!(index_name::<IpSetSpec>("prod"), ".feedsync.ipset.prod");
        assert_eq!(
            index_name::<DomainNameSetSpec>("cluster"),
            ".feedsync.domainnameset.cluster"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path_and_escapes() {
        let es = client("https://es.example.com:9200/proxy/");
        let url = es.endpoint(&[".feedsync.ipset.cluster", "_doc", "a b/c"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://es.example.com:9200/proxy/.feedsync.ipset.cluster/_doc/a%20b%2Fc"
        );

        let es = client("http://localhost:9200");
        let url = es.endpoint(&["_search", "scroll"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9200/_search/scroll");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = ElasticConfig {
            url: "mailto:admin@example.com".to_string(),
            ..ElasticConfig::default()
        };
        assert!(matches!(ElasticClient::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_delete_url_with_and_without_tokens() {
        let base = Url::parse("http://localhost:9200/idx/_doc/feed1").unwrap();

        let url = delete_url(base.clone(), &Meta::new("feed1"));
        assert_eq!(url.query(), None);

        let meta = Meta {
            name: "feed1".to_string(),
            seq_no: Some(7),
            primary_term: Some(2),
        };
        let url = delete_url(base, &meta);
        assert_eq!(url.query(), Some("if_seq_no=7&if_primary_term=2"));
    }

    #[test]
    fn test_error_reason() {
        let body = r#"{"error":{"type":"resource_already_exists_exception","reason":"index [x] already exists"},"status":400}"#;
        assert_eq!(
            error_reason(body),
            "resource_already_exists_exception: index [x] already exists"
        );
        assert_eq!(error_reason(r#"{"error":"no handler found"}"#), "no handler found");
        assert_eq!(error_reason("  Bad Gateway \n"), "Bad Gateway");
    }

    #[test]
    fn test_search_response_into_metas() {
        let body = json!({
            "_scroll_id": "abc",
            "hits": { "hits": [
                { "_id": "feed1", "_seq_no": 3, "_primary_term": 1 },
                { "_id": "feed2" }
            ]}
        });
        let response: SearchResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.scroll_id.as_deref(), Some("abc"));

        let metas: Vec<Meta> = response.hits.hits.into_iter().map(Hit::into_meta).collect();
        assert_eq!(
            metas,
            vec![
                Meta {
                    name: "feed1".to_string(),
                    seq_no: Some(3),
                    primary_term: Some(1),
                },
                Meta::new("feed2"),
            ]
        );
    }

    #[test]
    fn test_ip_set_document() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let set = IpSetSpec(vec!["1.2.3.4/32".to_string()]);
        let document = set.to_document(created_at).unwrap();

        assert_eq!(
            document,
            json!({ "created_at": "2024-01-02T03:04:05Z", "ips": ["1.2.3.4/32"] })
        );
        assert_eq!(IpSetSpec::from_document(document).unwrap(), set);
    }

    #[test]
    fn test_domain_set_document() {
        let document = json!({
            "created_at": "2024-01-02T03:04:05Z",
            "domains": ["evil.example.com"]
        });
        assert_eq!(
            DomainNameSetSpec::from_document(document).unwrap(),
            DomainNameSetSpec(vec!["evil.example.com".to_string()])
        );
        assert!(matches!(
            DomainNameSetSpec::from_document(json!({ "domains": [] })),
            Err(Error::Json(_))
        ));
    }

    /// 依次以给定响应应答的 HTTP 服务，每个连接处理一个请求，返回收到的请求
    async fn serve(
        responses: Vec<(&'static str, Value)>,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status_line, body) in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut stream).await);
                let body = body.to_string();
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            requests
        });
        (format!("http://{}", addr), handle)
    }

    /// 读取完整请求（包括请求体）
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&data[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&data).to_string()
    }

    fn es_error(kind: &str, reason: &str, status: u16) -> Value {
        json!({ "error": { "type": kind, "reason": reason }, "status": status })
    }

    #[tokio::test]
    async fn test_delete_absent_document_succeeds_but_conflict_fails() {
        let (url, server) = serve(vec![
            ("404 Not Found", json!({ "_id": "feed1", "result": "not_found" })),
            (
                "409 Conflict",
                es_error("version_conflict_engine_exception", "[feed1]: version conflict", 409),
            ),
        ])
        .await;
        let es = client(&url);
        let meta = Meta {
            name: "feed1".to_string(),
            seq_no: Some(4),
            primary_term: Some(1),
        };

        es.delete_document(".feedsync.ipset.cluster", &meta).await.unwrap();
        let err = es
            .delete_document(".feedsync.ipset.cluster", &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Elastic { status: 409, .. }));

        let requests = server.await.unwrap();
        assert!(requests[0]
            .starts_with("DELETE /.feedsync.ipset.cluster/_doc/feed1?if_seq_no=4&if_primary_term=1 "));
    }

    #[tokio::test]
    async fn test_list_missing_index_is_empty() {
        let (url, server) = serve(vec![(
            "404 Not Found",
            es_error("index_not_found_exception", "no such index", 404),
        )])
        .await;

        let metas = client(&url)
            .list_documents(".feedsync.ipset.cluster")
            .await
            .unwrap();
        assert!(metas.is_empty());
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_follows_scroll_and_clears_it() {
        let (url, server) = serve(vec![
            (
                "200 OK",
                json!({ "_scroll_id": "s1", "hits": { "hits": [
                    { "_id": "a", "_seq_no": 1, "_primary_term": 1 },
                    { "_id": "b", "_seq_no": 2, "_primary_term": 1 }
                ]}}),
            ),
            ("200 OK", json!({ "_scroll_id": "s2", "hits": { "hits": [{ "_id": "c" }] } })),
            ("200 OK", json!({ "_scroll_id": "s2", "hits": { "hits": [] } })),
            ("200 OK", json!({ "succeeded": true, "num_freed": 1 })),
        ])
        .await;

        let metas = client(&url)
            .list_documents(".feedsync.ipset.cluster")
            .await
            .unwrap();
        let names: Vec<&str> = metas.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(metas[1].seq_no, Some(2));

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("POST /.feedsync.ipset.cluster/_search?scroll=5m "));
        assert!(requests[0].contains(r#""seq_no_primary_term":true"#));
        assert!(requests[1].starts_with("POST /_search/scroll ") && requests[1].contains("s1"));
        assert!(requests[2].starts_with("POST /_search/scroll ") && requests[2].contains("s2"));
        assert!(requests[3].starts_with("DELETE /_search/scroll ") && requests[3].contains("s2"));
    }

    #[tokio::test]
    async fn test_create_existing_index_succeeds() {
        let (url, _server) = serve(vec![
            (
                "400 Bad Request",
                es_error("resource_already_exists_exception", "index already exists", 400),
            ),
            (
                "400 Bad Request",
                es_error("mapper_parsing_exception", "unknown type [ipz]", 400),
            ),
        ])
        .await;
        let es = client(&url);
        let body = json!({ "mappings": IpSetSpec::mapping() });

        es.create_index(".feedsync.ipset.cluster", &body).await.unwrap();
        let err = es.create_index(".feedsync.ipset.cluster", &body).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Elastic { status: 400, ref reason } if reason.starts_with("mapper_parsing_exception")
        ));
    }

    #[tokio::test]
    async fn test_backend_creates_index_once() {
        let (url, server) = serve(vec![
            ("200 OK", json!({ "acknowledged": true })),
            ("201 Created", json!({ "result": "created" })),
            ("200 OK", json!({ "result": "updated" })),
        ])
        .await;
        let config = ElasticConfig {
            url,
            ..ElasticConfig::default()
        };
        let backend = IpSetBackend::new(ElasticClient::new(&config).unwrap(), &config);
        let set = IpSetSpec(vec!["1.2.3.4/32".to_string()]);

        backend.put("feed1", &set).await.unwrap();
        backend.put("feed1", &set).await.unwrap();

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("PUT /.feedsync.ipset.cluster "));
        assert!(requests[0].contains(r#""ip_range""#));
        assert!(requests[1].starts_with("PUT /.feedsync.ipset.cluster/_doc/feed1 "));
        assert!(requests[2].starts_with("PUT /.feedsync.ipset.cluster/_doc/feed1 "));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_network_error() {
        // 绑定后立即释放端口，连接会被拒绝
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ElasticConfig {
            url: format!("http://{}", addr),
            ..ElasticConfig::default()
        };
        let backend = IpSetBackend::new(ElasticClient::new(&config).unwrap(), &config);
        let err = backend.list().await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
