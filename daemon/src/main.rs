use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tallyman::{
    ClaimTtlMs, RedisFastStore, RedisFastStoreOptions, SqliteSumStore, StorePrefix,
    SweepIntervalMs, Tallyman, TallymanError, TallymanOptions, TallymanRedisClient,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tallyman-daemon",
    about = "Flushes closed tallyman windows from Redis into SQLite"
)]
struct Args {
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    /// Number of pooled Redis connections for commands and scripts.
    #[arg(long, default_value_t = 4)]
    redis_connections: usize,

    #[arg(long, env = "TALLYMAN_SQLITE_PATH", default_value = "tallyman.db")]
    sqlite_path: PathBuf,

    /// Key namespace; must match the processes applying increments.
    #[arg(long, default_value = "tallyman")]
    prefix: String,

    #[arg(long, default_value_t = 10_000)]
    claim_ttl_ms: u64,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[arg(long, default_value_t = 30_000)]
    sweep_interval_ms: u64,

    /// Run `CONFIG SET notify-keyspace-events Ex` on startup.
    #[arg(long, default_value_t = false)]
    configure_keyspace_events: bool,
}

#[tokio::main]
async fn main() -> Result<(), TallymanError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let client = redis::Client::open(args.redis_url.as_str())?;
    let client = TallymanRedisClient::from_client(client, args.redis_connections).await?;

    let fast = RedisFastStore::new(
        client,
        RedisFastStoreOptions {
            configure_keyspace_events: args.configure_keyspace_events,
            ..Default::default()
        },
    )
    .await?;
    let durable = Arc::new(SqliteSumStore::open(&args.sqlite_path)?);

    let tallyman = Tallyman::new(
        fast,
        durable,
        TallymanOptions {
            prefix: Some(StorePrefix::try_from(args.prefix.as_str())?),
            claim_ttl_ms: ClaimTtlMs::try_from(args.claim_ttl_ms)?,
            sweep_interval_ms: SweepIntervalMs::try_from(args.sweep_interval_ms)?,
            ..Default::default()
        },
    );

    let workers = tallyman.start_flush_workers(args.workers).await?;
    tallyman.run_sweep_loop();

    tracing::info!(
        prefix = %args.prefix,
        workers = args.workers,
        sqlite_path = %args.sqlite_path.display(),
        "tallyman-daemon running"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?err, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutting down");

    tallyman.stop_sweep_loop();
    workers.shutdown().await;

    Ok(())
}
