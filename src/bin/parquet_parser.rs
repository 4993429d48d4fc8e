use std::sync::Arc;

use etl_workers::cache::{BackingStore, HttpStore};
use etl_workers::config::{init_tracing, ParquetArgs};
use etl_workers::server::{self, ParquetState};
use etl_workers::tabular::{resolve_format, Converter};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = ParquetArgs::parse_args();

    // 启动时只提示，请求时才决定是否失败
    if let Err(e) = resolve_format(None, args.output_format()) {
        warn!("{}", e);
    }

    let converter = Arc::new(Converter::with_available_parallelism()?);
    let store = args
        .target_url()
        .map(|url| Arc::new(HttpStore::new(url)) as Arc<dyn BackingStore>);

    let state = ParquetState {
        converter: converter.clone(),
        output_format: args.output_format().map(str::to_owned),
        store,
    };

    let listener = server::bind(&args.listen, args.port).await?;
    info!(
        "parquet-parser listening on {} ({} workers, default format {})",
        listener.local_addr()?,
        converter.parallelism(),
        args.output_format().unwrap_or("json")
    );

    server::serve(listener, server::parquet::router(state), args.drain_timeout()).await
}
