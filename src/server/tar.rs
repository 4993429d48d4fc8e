//! tar2tf HTTP 接口
//!
//! ```text
//! GET  /health                        -> OK
//! GET  /v1/objects/<bucket>/<name>    -> 缓存的 TFRecord（支持 Range）
//! GET  /<bucket>/<name>               -> 同上
//! PUT  /...                           -> 请求体即 TAR，直接转换
//! ```

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, Method, Uri};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};

use super::response::{
    binary_response, bytes_response, header_str, health, invalid_method, HEADER_VERSION,
};
use crate::cache::{ArtifactCache, ObjectId};
use crate::core::{copy_section, parse_range, ChannelWriter, TeeWriter, WriteCounter};
use crate::error::{EtlError, EtlResult};
use crate::pipeline::{ArchiveKind, Pipeline};

/// 流式 PUT 的 channel 深度（每块最多 64KiB）
const STREAM_DEPTH: usize = 8;

#[derive(Clone)]
pub struct TarState {
    pub cache: Arc<ArtifactCache>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TarQuery {
    pub archive_type: Option<String>,
}

impl TarQuery {
    fn archive(&self) -> ArchiveKind {
        ArchiveKind::from_query(self.archive_type.as_deref())
    }
}

pub fn router(cache: Arc<ArtifactCache>) -> Router {
    Router::new()
        .route("/health", get(health).fallback(invalid_method))
        .route(
            "/v1/objects/:bucket/*name",
            get(get_object).put(put_transform).fallback(invalid_method),
        )
        .fallback(dispatch)
        .layer(DefaultBodyLimit::disable())
        .with_state(TarState { cache })
}

async fn get_object(
    State(state): State<TarState>,
    Path((bucket, name)): Path<(String, String)>,
    Query(query): Query<TarQuery>,
    headers: HeaderMap,
) -> Result<Response, EtlError> {
    let obj = ObjectId::new(bucket, name, query.archive().is_gzip());
    serve_cached(&state, obj, &headers).await
}

async fn put_transform(
    State(state): State<TarState>,
    Query(query): Query<TarQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, EtlError> {
    transform_body(&state, query.archive(), &headers, body).await
}

/// 其余路径：PUT 一律按 TAR 转换，GET 按 `<bucket>/<name>` 读缓存
async fn dispatch(
    State(state): State<TarState>,
    method: Method,
    uri: Uri,
    Query(query): Query<TarQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, EtlError> {
    match method {
        Method::PUT => transform_body(&state, query.archive(), &headers, body).await,
        Method::GET => {
            let path = uri.path().trim_start_matches('/');
            let Some((bucket, name)) = path.split_once('/').filter(|(b, n)| !b.is_empty() && !n.is_empty())
            else {
                return Err(EtlError::bad_input(format!(
                    "expected 2 path elements, got {path:?}"
                )));
            };
            let obj = ObjectId::new(bucket, name, query.archive().is_gzip());
            serve_cached(&state, obj, &headers).await
        }
        other => Ok(invalid_method(other).await),
    }
}

/// GET：取得（必要时重建）缓存 artifact，按 Range 流式返回窗口
async fn serve_cached(state: &TarState, obj: ObjectId, headers: &HeaderMap) -> EtlResult<Response> {
    let artifact = state.cache.fetch(&obj).await?;
    let size = artifact.size;
    let range = parse_range(header_str(headers, header::RANGE), size).map_err(|e| e.into_etl(size))?;
    let version = artifact.version.clone();

    let reader = state.cache.open_window(artifact, range).await?;
    Ok(binary_response(
        Body::from_stream(ReaderStream::new(reader)),
        Some(range.length),
        Some(&version),
    ))
}

/// PUT：请求体 -> pipeline -> 响应。带 Range 时先整体缓冲再切片，否则流式输出。
async fn transform_body(
    state: &TarState,
    archive: ArchiveKind,
    headers: &HeaderMap,
    body: Body,
) -> EtlResult<Response> {
    let version = header_str(headers, HEADER_VERSION).map(str::to_owned);
    let range = header_str(headers, header::RANGE).map(str::to_owned);
    let job = state.cache.job();

    let stream = body
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let reader = SyncIoBridge::new(StreamReader::new(Box::pin(stream)));

    if let Some(range) = range {
        let (buffered, size) = tokio::task::spawn_blocking(move || -> EtlResult<(Vec<u8>, u64)> {
            let counter = WriteCounter::new();
            let mut buf = Vec::new();
            Pipeline::new(reader, TeeWriter::new(&mut buf, &counter), archive, job.as_deref())
                .run()?;
            Ok((buf, counter.size()))
        })
        .await??;

        let rng = parse_range(Some(&range), size).map_err(|e| e.into_etl(size))?;
        let mut out = Vec::with_capacity(rng.length as usize);
        copy_section(&mut &buffered[..], &mut out, rng.start, rng.length)?;
        return Ok(bytes_response(out, version.as_deref()));
    }

    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(STREAM_DEPTH);
    let task = tokio::task::spawn_blocking(move || {
        let res = Pipeline::new(reader, ChannelWriter::new(tx.clone()), archive, job.as_deref()).run();
        if let Err(e) = &res {
            let _ = tx.blocking_send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
        }
        res
    });

    let first = rx.recv().await;
    match first {
        Some(Ok(first)) => {
            let rest = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            let stream = futures::stream::once(async move { Ok(first) }).chain(rest);
            Ok(binary_response(
                Body::from_stream(stream),
                None,
                version.as_deref(),
            ))
        }
        // 第一块之前就结束：返回 pipeline 的原始错误，或空输出
        _ => {
            drop(rx);
            let stats = task.await??;
            tracing::debug!("PUT transform produced no output ({} samples)", stats.samples);
            Ok(bytes_response(Vec::new(), version.as_deref()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::remote::tests::MemoryStore;
    use crate::cache::{BackingStore, CacheConfig};
    use crate::pipeline::sample::tests::build_tar;
    use crate::pipeline::transform::tests::png_bytes;
    use crate::pipeline::{read_examples, TransformJob};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app_with_store() -> (Router, Arc<MemoryStore>, tempfile::TempDir) {
        app_with_job(None)
    }

    fn app_with_job(job: Option<TransformJob>) -> (Router, Arc<MemoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let cache = ArtifactCache::new(
            CacheConfig {
                parent_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
            Some(store.clone() as Arc<dyn BackingStore>),
            job,
        )
        .unwrap();
        (router(Arc::new(cache)), store, dir)
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn put_streams_records() {
        let (app, _, _dir) = app_with_store();
        let tar = build_tar(&[("s1.cls", &b"1"[..]), ("s2.cls", &b"2"[..])]);
        let resp = app
            .oneshot(
                Request::put("/")
                    .header(HEADER_VERSION, "9")
                    .body(Body::from(tar))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-amz-version-id"], "9");
        let out = body_bytes(resp).await;
        assert_eq!(read_examples(&out[..]).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn put_with_range_slices_output() {
        let (app, _, _dir) = app_with_store();
        let tar = build_tar(&[("s1.cls", &b"1"[..])]);

        let whole = body_bytes(
            app.clone()
                .oneshot(Request::put("/x.tar").body(Body::from(tar.clone())).unwrap())
                .await
                .unwrap(),
        )
        .await;

        let resp = app
            .oneshot(
                Request::put("/x.tar")
                    .header(header::RANGE, "bytes=2-9")
                    .body(Body::from(tar))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "8");
        assert_eq!(body_bytes(resp).await, whole[2..10]);
    }

    #[tokio::test]
    async fn put_with_range_past_end_is_not_satisfiable() {
        let (app, _, _dir) = app_with_store();
        let tar = build_tar(&[("s1.cls", &b"1"[..])]);
        let size = body_bytes(
            app.clone()
                .oneshot(Request::put("/x.tar").body(Body::from(tar.clone())).unwrap())
                .await
                .unwrap(),
        )
        .await
        .len();

        let resp = app
            .oneshot(
                Request::put("/x.tar")
                    .header(header::RANGE, format!("bytes={}-", size + 5))
                    .body(Body::from(tar))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            resp.headers()[header::CONTENT_RANGE],
            format!("bytes */{size}").as_str()
        );
    }

    #[tokio::test]
    async fn put_failure_after_first_chunk_aborts_body() {
        let job = TransformJob::from_json(br#"{"conversions": [{"type": "Decode", "ext_name": "png"}]}"#)
            .unwrap();
        let (app, _, _dir) = app_with_job(Some(job));
        let png = png_bytes(2, 2);
        let big = vec![7u8; 100 * 1024];
        let tar = build_tar(&[
            ("a.png", &png[..]),
            ("a.bin", &big[..]),
            ("b.png", &b"not a png"[..]),
        ]);

        let resp = app
            .oneshot(Request::put("/").body(Body::from(tar)).unwrap())
            .await
            .unwrap();
        // 第一块已经发出，状态码只能是 200，之后 body 流报错
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(axum::body::to_bytes(resp.into_body(), usize::MAX).await.is_err());
    }

    #[tokio::test]
    async fn put_garbage_is_bad_request() {
        let (app, _, _dir) = app_with_store();
        let resp = app
            .oneshot(Request::put("/").body(Body::from(vec![0x42u8; 2048])).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_short_path_is_bad_request() {
        let (app, _, _dir) = app_with_store();
        let resp = app
            .oneshot(Request::get("/onlybucket").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_legacy_path_serves_cached_object() {
        let (app, store, _dir) = app_with_store();
        store.put("bck", "a.tar", "3", build_tar(&[("s1.cls", &b"1"[..])]));
        let resp = app
            .oneshot(Request::get("/bck/a.tar").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-amz-version-id"], "3");
    }
}
