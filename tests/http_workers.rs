use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use etl_workers::cache::{ArtifactCache, BackingStore, CacheConfig, ObjectId, ObjectReader};
use etl_workers::error::{EtlError, EtlResult};
use etl_workers::pipeline::read_examples;
use etl_workers::server::{self, ParquetState};
use etl_workers::tabular::Converter;
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use tower::ServiceExt;

#[derive(Default)]
struct FixedStore {
    objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl FixedStore {
    fn insert(&self, key: &str, version: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .insert(key.to_string(), (version.to_string(), data));
    }

    fn lookup(&self, obj: &ObjectId) -> EtlResult<(String, Vec<u8>)> {
        let key = format!("{}/{}", obj.bucket, obj.name);
        self.objects
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| EtlError::RemoteUnavailable(format!("404 {key}")))
    }
}

#[async_trait]
impl BackingStore for FixedStore {
    async fn head_version(&self, obj: &ObjectId) -> EtlResult<String> {
        Ok(self.lookup(obj)?.0)
    }

    async fn get(&self, obj: &ObjectId) -> EtlResult<ObjectReader> {
        Ok(Box::new(std::io::Cursor::new(self.lookup(obj)?.1)))
    }
}

fn tar_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut hdr = tar::Header::new_gnu();
        hdr.set_size(data.len() as u64);
        hdr.set_mode(0o644);
        hdr.set_cksum();
        builder.append_data(&mut hdr, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn shard() -> Vec<u8> {
    tar_of(&[
        ("train/0001.cls", b"3"),
        ("train/0001.txt", b"a cat"),
        ("train/0002.cls", b"5"),
        ("train/0002.txt", b"a dog"),
    ])
}

fn tar2tf_app(store: Arc<FixedStore>) -> (Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let cache = ArtifactCache::new(
        CacheConfig {
            parent_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
        Some(store as Arc<dyn BackingStore>),
        None,
    )
    .unwrap();
    (server::tar::router(Arc::new(cache)), dir)
}

fn parquet_app(output_format: Option<&str>) -> Router {
    server::parquet::router(ParquetState {
        converter: Arc::new(Converter::new(4).unwrap()),
        output_format: output_format.map(str::to_owned),
        store: None,
    })
}

fn people_parquet() -> Vec<u8> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef,
            Arc::new(StringArray::from(vec![Some("ann"), None, Some("o,k")])) as ArrayRef,
        ],
    )
    .unwrap();
    let mut out = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut out, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    out
}

async fn body_bytes(resp: Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn get(app: &Router, uri: &str, range: Option<&str>) -> Response {
    let mut req = Request::get(uri);
    if let Some(r) = range {
        req = req.header(header::RANGE, r);
    }
    app.clone().oneshot(req.body(Body::empty()).unwrap()).await.unwrap()
}

#[tokio::test]
async fn health_and_unknown_methods() {
    let (app, _dir) = tar2tf_app(Arc::new(FixedStore::default()));
    let resp = get(&app, "/health", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, b"OK");

    let resp = app
        .clone()
        .oneshot(Request::delete("/bck/obj.tar").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = parquet_app(None)
        .oneshot(Request::post("/x.parquet").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_and_put_produce_identical_records() {
    let store = Arc::new(FixedStore::default());
    store.insert("bck/shard.tar", "1", shard());
    let (app, _dir) = tar2tf_app(store);

    let resp = get(&app, "/v1/objects/bck/shard.tar", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "binary/octet-stream");
    let via_get = body_bytes(resp).await;

    let resp = app
        .clone()
        .oneshot(Request::put("/v1/objects/bck/shard.tar").body(Body::from(shard())).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let via_put = body_bytes(resp).await;

    assert_eq!(via_get, via_put);
    assert_eq!(read_examples(&via_get[..]).unwrap().len(), 2);
}

#[tokio::test]
async fn ranges_on_cached_artifact() {
    let store = Arc::new(FixedStore::default());
    store.insert("bck/shard.tar", "1", shard());
    let (app, _dir) = tar2tf_app(store);

    let whole = body_bytes(get(&app, "/v1/objects/bck/shard.tar", None).await).await;
    let size = whole.len();

    let resp = get(&app, "/v1/objects/bck/shard.tar", Some("bytes=4-11")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_LENGTH], "8");
    assert_eq!(body_bytes(resp).await, whole[4..12]);

    // 后缀长度超过文件大小：返回整个文件
    let suffix = format!("bytes=-{}", size + 100);
    let resp = get(&app, "/v1/objects/bck/shard.tar", Some(&suffix)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, whole);

    let past_end = format!("bytes={}-", size + 10);
    let resp = get(&app, "/v1/objects/bck/shard.tar", Some(&past_end)).await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        resp.headers()[header::CONTENT_RANGE],
        format!("bytes */{size}").as_str()
    );

    let resp = get(&app, "/v1/objects/bck/shard.tar", Some("bytes=0-1,4-5")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_remote_object_is_bad_request() {
    let (app, _dir) = tar2tf_app(Arc::new(FixedStore::default()));
    let resp = get(&app, "/v1/objects/bck/nope.tar", None).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn parquet_passthrough_and_csv() {
    let app = parquet_app(Some("csv"));

    let resp = app
        .clone()
        .oneshot(Request::put("/bck/notes.txt").body(Body::from("plain bytes")).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, b"plain bytes");

    let resp = app
        .clone()
        .oneshot(
            Request::put("/bck/people.parquet")
                .body(Body::from(people_parquet()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(resp).await).unwrap();
    assert_eq!(text, "id,name\n1,ann\n2,\n3,\"o,k\"\n");

    let resp = app
        .oneshot(Request::put("/?args=json").body(Body::from(people_parquet())).unwrap())
        .await
        .unwrap();
    let text = String::from_utf8(body_bytes(resp).await).unwrap();
    let rows: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["id"], 1);
    assert!(rows[1]["name"].is_null());
}

#[tokio::test]
async fn corrupt_parquet_is_bad_request() {
    let resp = parquet_app(None)
        .oneshot(Request::put("/x.parquet").body(Body::from("PAR1 nope")).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
