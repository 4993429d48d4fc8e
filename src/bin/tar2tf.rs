use std::sync::Arc;

use etl_workers::cache::{ArtifactCache, BackingStore, HttpStore, TARGET_URL_ENV};
use etl_workers::config::{init_tracing, Tar2TfArgs};
use etl_workers::server;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Tar2TfArgs::parse_args();

    let job = args.load_job()?;
    let config = args.cache_config()?;

    let store: Option<Arc<dyn BackingStore>> = match args.target_url() {
        Some(url) => {
            info!("backing store: {}", url);
            Some(Arc::new(HttpStore::new(url)))
        }
        None => {
            warn!("{} not set, GET requests will be rejected", TARGET_URL_ENV);
            None
        }
    };

    let cache = Arc::new(ArtifactCache::new(config, store, job)?);
    let gc = cache.spawn_gc();

    let listener = server::bind(&args.listen, args.port).await?;
    info!(
        "tar2tf listening on {} (cache root {})",
        listener.local_addr()?,
        cache.root().display()
    );

    server::serve(listener, server::tar::router(cache.clone()), args.drain_timeout()).await?;

    gc.abort();
    info!("final cache state\n{}", cache.report());
    Ok(())
}
