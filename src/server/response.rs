use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub use crate::cache::remote::{HEADER_AWS_VERSION, HEADER_VERSION};

pub const CONTENT_TYPE_BINARY: &str = "binary/octet-stream";

/// 成功响应：`Content-Type: binary/octet-stream`，可选 `Content-Length` 与版本头
pub fn binary_response(body: Body, length: Option<u64>, version: Option<&str>) -> Response {
    let mut resp = Response::new(body);
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(CONTENT_TYPE_BINARY),
    );
    if let Some(len) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    if let Some(v) = version.and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(HEADER_AWS_VERSION, v);
    }
    resp
}

/// 整块字节的成功响应
pub fn bytes_response(data: Vec<u8>, version: Option<&str>) -> Response {
    let len = data.len() as u64;
    binary_response(Body::from(data), Some(len), version)
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub async fn health() -> &'static str {
    "OK"
}

/// 未注册的方法一律 400
pub async fn invalid_method(method: axum::http::Method) -> Response {
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("invalid http method {method}"),
    )
        .into_response()
}
