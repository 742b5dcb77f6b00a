use std::{sync::Arc, time::Duration};

use blobmirror_cache::CacheBuilder;
use blobmirror_core::{BoxError, ObjectStoreBlob, build_object_store};
use blobmirror_server::{ServerBuilder, config::Conf, shutdown_signal};
use clap::Parser;
use structured_logger::{Builder, async_json::new_writer, get_env_level};
use tokio_util::sync::CancellationToken;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const SHUTDOWN_DURATION: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[clap(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    Builder::with_level(&get_env_level().to_string())
        .with_target_writer("*", new_writer(tokio::io::stdout()))
        .init();

    log::info!("bootstrap {}@{}", APP_NAME, APP_VERSION);
    match bootstrap(cli).await {
        Ok(()) => Ok(()),
        Err(err) => {
            log::error!("bootstrap error: {:?}", err);
            Err(err)
        }
    }
}

async fn bootstrap(cli: Cli) -> Result<(), BoxError> {
    let cfg = Conf::from_env()?;
    let settings = cfg.resolve()?;

    let store = build_object_store(&cfg.primary)?;
    let mut builder = CacheBuilder::new(&cfg.cachepath)
        .with_max_size(settings.max_size)
        .with_max_not_found(settings.max_not_found)
        .with_validity_period(settings.cache_time);
    if let Some(keep_forever) = settings.keep_forever.clone() {
        builder = builder.with_keep_forever(keep_forever);
    }
    let cache = Arc::new(builder.build(Arc::new(ObjectStoreBlob::new(store)))?);

    let cancel_token = CancellationToken::new();
    let server = ServerBuilder::new()
        .with_addr(cli.addr)
        .with_cache(Arc::clone(&cache))
        .with_settings(Arc::new(settings))
        .serve(shutdown_signal(cancel_token.clone(), SHUTDOWN_DURATION));

    let res = server.await;
    cache.close().await;
    res
}
