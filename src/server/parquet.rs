//! parquet-parser HTTP 接口
//!
//! ```text
//! GET  /health             -> OK
//! PUT  /                   -> 请求体按 parquet 转换
//! PUT  /<path>             -> 扩展名为 .parquet 时转换，否则原样返回
//! GET  /<bucket>/<name>    -> 从后端取对象后同 PUT 处理
//! ```
//! 输出格式：`?args=`（或 `etl_args`） > `OUTPUT_FORMAT` > json

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{Method, Uri};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use super::response::{bytes_response, health, invalid_method};
use crate::cache::{BackingStore, ObjectId, TARGET_URL_ENV};
use crate::error::{EtlError, EtlResult};
use crate::tabular::{resolve_format, Converter};

#[derive(Clone)]
pub struct ParquetState {
    pub converter: Arc<Converter>,
    /// `OUTPUT_FORMAT` 默认值（未校验，最终值非法时请求失败）
    pub output_format: Option<String>,
    pub store: Option<Arc<dyn BackingStore>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ParquetQuery {
    #[serde(alias = "etl_args")]
    pub args: Option<String>,
}

pub fn router(state: ParquetState) -> Router {
    Router::new()
        .route("/health", get(health).fallback(invalid_method))
        .fallback(dispatch)
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn dispatch(
    State(state): State<ParquetState>,
    method: Method,
    uri: Uri,
    Query(query): Query<ParquetQuery>,
    body: Body,
) -> Result<Response, EtlError> {
    let path = uri.path().trim_start_matches('/').to_string();
    match method {
        Method::PUT => {
            let data = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| EtlError::bad_input(format!("reading request body: {e}")))?;
            transform(&state, &path, data, query.args.as_deref()).await
        }
        Method::GET => {
            let data = fetch_object(&state, &path).await?;
            transform(&state, &path, data, query.args.as_deref()).await
        }
        other => Ok(invalid_method(other).await),
    }
}

async fn fetch_object(state: &ParquetState, path: &str) -> EtlResult<Bytes> {
    let store = state
        .store
        .as_ref()
        .ok_or_else(|| EtlError::missing_env(TARGET_URL_ENV))?;
    let Some((bucket, name)) = path.split_once('/').filter(|(b, n)| !b.is_empty() && !n.is_empty())
    else {
        return Err(EtlError::bad_input(format!(
            "expected 2 path elements, got {path:?}"
        )));
    };

    let mut reader = store.get(&ObjectId::new(bucket, name, false)).await?;
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .await
        .map_err(|e| EtlError::RemoteUnavailable(format!("reading {bucket}/{name}: {e}")))?;
    Ok(Bytes::from(data))
}

/// 非 `.parquet` 路径原样返回；空路径视为 parquet
pub fn is_parquet_path(path: &str) -> bool {
    path.is_empty()
        || std::path::Path::new(path)
            .extension()
            .map(|e| e.eq_ignore_ascii_case("parquet"))
            .unwrap_or(false)
}

async fn transform(
    state: &ParquetState,
    path: &str,
    data: Bytes,
    args: Option<&str>,
) -> EtlResult<Response> {
    if !is_parquet_path(path) {
        tracing::debug!("pass-through {:?} ({} bytes)", path, data.len());
        return Ok(bytes_response(data.to_vec(), None));
    }

    let format = resolve_format(args, state.output_format.as_deref())?;
    let converter = state.converter.clone();
    let out = tokio::task::spawn_blocking(move || converter.convert(data, format)).await??;
    Ok(bytes_response(out, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::remote::tests::MemoryStore;
    use crate::tabular::table::tests::id_name_parquet;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(output_format: Option<&str>, store: Option<Arc<dyn BackingStore>>) -> Router {
        router(ParquetState {
            converter: Arc::new(Converter::new(2).unwrap()),
            output_format: output_format.map(str::to_owned),
            store,
        })
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn sample() -> Bytes {
        id_name_parquet(&[(1, Some("a")), (2, Some("b"))], 16)
    }

    #[test]
    fn parquet_path_detection() {
        assert!(is_parquet_path(""));
        assert!(is_parquet_path("bck/data.parquet"));
        assert!(is_parquet_path("data.PARQUET"));
        assert!(!is_parquet_path("bck/data.csv"));
        assert!(!is_parquet_path("bck/noext"));
    }

    #[tokio::test]
    async fn args_override_env_format() {
        let resp = app(Some("txt"), None)
            .oneshot(Request::put("/?args=csv").body(Body::from(sample())).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "id,name\n1,a\n2,b\n");

        let resp = app(Some("txt"), None)
            .oneshot(Request::put("/?etl_args=bogus").body(Body::from(sample())).unwrap())
            .await
            .unwrap();
        assert_eq!(body_string(resp).await, "id\tname\n--\t----\n1\ta\n2\tb\n");
    }

    #[tokio::test]
    async fn unknown_env_format_is_bad_request() {
        let resp = app(Some("yaml"), None)
            .oneshot(Request::put("/").body(Body::from(sample())).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pull_mode_converts_remote_object() {
        let store = Arc::new(MemoryStore::default());
        store.put("bck", "t.parquet", "1", sample().to_vec());
        let resp = app(None, Some(store as Arc<dyn BackingStore>))
            .oneshot(Request::get("/bck/t.parquet").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_string(resp).await;
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with('{'));
    }

    #[tokio::test]
    async fn pull_mode_without_target_is_misconfigured() {
        let resp = app(None, None)
            .oneshot(Request::get("/bck/t.parquet").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains(TARGET_URL_ENV));
    }
}
