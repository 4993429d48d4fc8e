use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

/// 对外可见的错误分类（决定 HTTP 状态码）
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    /// 请求本身有问题：range / method / spec / 样本无法解码 / parquet 损坏 / 格式不支持
    #[error("{0}")]
    BadInput(String),

    /// 使用处才发现缺少必需配置（例如 AIS_TARGET_URL）
    #[error("{0}")]
    Misconfigured(String),

    /// 后端对象存储 HEAD/GET 失败或返回 >= 400
    #[error("{0}")]
    RemoteUnavailable(String),

    /// range 完全越过文件末尾
    #[error("requested range not satisfiable (size {size})")]
    Overlap { size: u64 },

    #[error("{0}")]
    Internal(String),
}

pub type EtlResult<T> = Result<T, EtlError>;

impl EtlError {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn missing_env(var: &str) -> Self {
        Self::Misconfigured(format!("missing env variable {var}"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            EtlError::BadInput(_) | EtlError::Misconfigured(_) | EtlError::RemoteUnavailable(_) => {
                StatusCode::BAD_REQUEST
            }
            EtlError::Overlap { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            EtlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for EtlError {
    fn from(e: std::io::Error) -> Self {
        EtlError::Internal(e.to_string())
    }
}

impl From<tokio::task::JoinError> for EtlError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            EtlError::Internal(format!("transform task panicked: {e}"))
        } else {
            EtlError::Internal(format!("transform task cancelled: {e}"))
        }
    }
}

impl IntoResponse for EtlError {
    fn into_response(self) -> Response {
        let status = self.status();
        match status {
            StatusCode::INTERNAL_SERVER_ERROR => tracing::error!("request failed: {}", self),
            _ => tracing::warn!("request failed ({}): {}", status.as_u16(), self),
        }

        let mut resp = (status, self.to_string()).into_response();
        let headers = resp.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let EtlError::Overlap { size } = self {
            if let Ok(v) = HeaderValue::from_str(&format!("bytes */{size}")) {
                headers.insert(header::CONTENT_RANGE, v);
            }
        }
        resp
    }
}
