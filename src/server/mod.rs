//! HTTP 接口与优雅退出

pub mod parquet;
pub mod response;
pub mod tar;

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Notify;

pub use parquet::ParquetState;
pub use tar::TarState;

/// 绑定 `ip:port`；失败即启动失败
pub async fn bind(ip: &str, port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("{ip}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    Ok(listener)
}

/// 服务直到收到 ctrl-c / SIGTERM，之后最多再等 `drain` 让在途请求完成
pub async fn serve(listener: TcpListener, app: Router, drain: Duration) -> anyhow::Result<()> {
    serve_until(listener, app, shutdown_signal(), drain).await
}

pub async fn serve_until(
    listener: TcpListener,
    app: Router,
    signal: impl Future<Output = ()> + Send + 'static,
    drain: Duration,
) -> anyhow::Result<()> {
    let started = Arc::new(Notify::new());
    let notify = started.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        signal.await;
        notify.notify_one();
    });
    let mut server = std::pin::pin!(server.into_future());

    tokio::select! {
        res = &mut server => return Ok(res?),
        _ = started.notified() => {}
    }

    tracing::info!("draining in-flight requests (up to {:?})", drain);
    match tokio::time::timeout(drain, server).await {
        Ok(res) => res?,
        Err(_) => tracing::warn!("drain deadline exceeded, aborting remaining requests"),
    }
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn stops_after_signal_and_drain() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/health", get(response::health));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(serve_until(
            listener,
            app,
            async move {
                let _ = rx.await;
            },
            Duration::from_secs(1),
        ));

        let body = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = bind("127.0.0.1", 0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind("127.0.0.1", port).await.unwrap_err();
        assert!(err.to_string().contains("failed to bind"));
    }
}
