use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::error::{EtlError, EtlResult};

pub const HEADER_VERSION: &str = "version";
pub const HEADER_AWS_VERSION: &str = "x-amz-version-id";

const ERROR_EXCERPT: usize = 256;

/// 缓存对象标识：(bucket, name) + 是否 gzip 封装
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub bucket: String,
    pub name: String,
    pub gzip: bool,
}

impl ObjectId {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>, gzip: bool) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            gzip,
        }
    }

    /// 缓存根目录下的相对路径 `<bucket>/<name>`；拒绝 `..` / 绝对路径
    pub fn relative_path(&self) -> EtlResult<PathBuf> {
        let mut out = PathBuf::new();
        for part in [self.bucket.as_str(), self.name.as_str()] {
            for c in Path::new(part).components() {
                match c {
                    Component::Normal(seg) => out.push(seg),
                    Component::CurDir => {}
                    _ => {
                        return Err(EtlError::bad_input(format!(
                            "invalid object path {}/{}",
                            self.bucket, self.name
                        )))
                    }
                }
            }
        }
        if out.components().count() < 2 {
            return Err(EtlError::bad_input(format!(
                "expected <bucket>/<name>, got {:?}/{:?}",
                self.bucket, self.name
            )));
        }
        Ok(out)
    }
}

pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// 后端对象存储（权威版本来源）
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// HEAD：返回对象当前版本
    async fn head_version(&self, obj: &ObjectId) -> EtlResult<String>;
    /// GET：返回对象内容流
    async fn get(&self, obj: &ObjectId) -> EtlResult<ObjectReader>;
}

/// 基于 `AIS_TARGET_URL` 的 HTTP 实现
pub struct HttpStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn object_url(&self, obj: &ObjectId) -> String {
        format!("{}/v1/objects/{}/{}", self.base_url, obj.bucket, obj.name)
    }

    async fn check(url: &str, resp: reqwest::Response) -> EtlResult<reqwest::Response> {
        let status = resp.status();
        if status.as_u16() < 400 {
            return Ok(resp);
        }
        let body = resp.bytes().await.unwrap_or_default();
        let excerpt = String::from_utf8_lossy(&body[..body.len().min(ERROR_EXCERPT)]).into_owned();
        Err(EtlError::RemoteUnavailable(format!(
            "{} error from {}: {}",
            status.as_u16(),
            url,
            excerpt.trim()
        )))
    }
}

fn unreachable(url: &str, e: reqwest::Error) -> EtlError {
    EtlError::RemoteUnavailable(format!("failed to reach {url}: {e}"))
}

/// 版本号优先取 `version`，其次 `x-amz-version-id`
pub fn version_from_headers(headers: &reqwest::header::HeaderMap) -> String {
    [HEADER_VERSION, HEADER_AWS_VERSION]
        .iter()
        .find_map(|h| headers.get(*h).and_then(|v| v.to_str().ok()))
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl BackingStore for HttpStore {
    async fn head_version(&self, obj: &ObjectId) -> EtlResult<String> {
        let url = self.object_url(obj);
        let resp = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        let resp = Self::check(&url, resp).await?;
        Ok(version_from_headers(resp.headers()))
    }

    async fn get(&self, obj: &ObjectId) -> EtlResult<ObjectReader> {
        let url = self.object_url(obj);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        let resp = Self::check(&url, resp).await?;
        let stream = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }
}
