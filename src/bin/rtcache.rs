//! rtcache CLI: run workers against a shared queue, or query it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use rtcache::config::secrets::ExposeSecret;
use rtcache::config::{CacheConfig, Config};
use rtcache::telemetry::{TelemetryConfig, init_telemetry};
use rtcache::worker::{ComputeError, from_fn};
use rtcache::{BytesCodec, ReadThroughCache, RedisStore, Store};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as Process;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rtcache", about = "Distributed read-through cache")]
struct Cli {
    /// Queue name (overrides RTCACHE_QUEUE)
    #[arg(long, global = true)]
    queue: Option<String>,
    /// TOML file with cache settings (overrides RTCACHE_* variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers that compute missing entries with an external program
    Serve {
        /// Number of concurrent workers
        #[arg(long)]
        workers: Option<usize>,
        /// Program and arguments; the id is appended as the last argument
        #[arg(required = true, last = true)]
        program: Vec<String>,
    },
    /// Fetch an entry and write its raw bytes to stdout
    Get {
        id: String,
        /// Priority (lower = sooner)
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Make sure entries are computed without fetching them
    Warm {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Priority (lower = sooner)
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Show queued and in-progress ids
    Status {
        /// Maximum queued ids to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _telemetry = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "rtcache".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let mut cache_config = match cli.config {
        Some(ref path) => CacheConfig::from_file(path)?,
        None => config.cache.clone(),
    };
    if let Some(queue) = cli.queue {
        cache_config.queue_name = queue;
    }

    let store: Arc<dyn Store> =
        Arc::new(RedisStore::connect(config.redis_url.expose_secret()).await?);

    match cli.command {
        Command::Serve { workers, program } => {
            if let Some(workers) = workers {
                cache_config.workers = workers;
            }
            cmd_serve(store, cache_config, program).await
        }
        Command::Get { id, priority } => cmd_get(store, cache_config, id, priority).await,
        Command::Warm { ids, priority } => cmd_warm(store, cache_config, ids, priority).await,
        Command::Status { limit } => cmd_status(store, cache_config, limit).await,
    }
}

async fn cmd_serve(
    store: Arc<dyn Store>,
    config: CacheConfig,
    program: Vec<String>,
) -> anyhow::Result<()> {
    let program = Arc::new(program);
    let compute = from_fn(move |priority, id: String| {
        let program = Arc::clone(&program);
        async move { run_program(&program, priority, &id).await }
    });

    let cache = ReadThroughCache::with_config(store, config, Some(compute), BytesCodec).await?;
    info!(queue = %cache.queue_name(), workers = cache.workers(), "serving, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cache.shutdown().await;
    Ok(())
}

/// Run `program` for one id. Stdout is the payload; a failing exit status
/// becomes the stored error, carrying stderr.
async fn run_program(program: &[String], priority: i64, id: &str) -> Result<Vec<u8>, ComputeError> {
    let (command, args) = program
        .split_first()
        .ok_or("no program configured")?;

    let output = Process::new(command)
        .args(args)
        .arg(id)
        .env("RTCACHE_ID", id)
        .env("RTCACHE_PRIORITY", priority.to_string())
        .stdin(Stdio::null())
        .output()
        .await?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "{command} exited with status {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )
        .into())
    }
}

async fn cmd_get(
    store: Arc<dyn Store>,
    config: CacheConfig,
    id: String,
    priority: i64,
) -> anyhow::Result<()> {
    let cache = ReadThroughCache::with_config(store, config, None, BytesCodec).await?;
    let bytes = cache.get_bytes(priority, &id).await;
    cache.shutdown().await;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&bytes?).await?;
    stdout.flush().await?;
    Ok(())
}

async fn cmd_warm(
    store: Arc<dyn Store>,
    config: CacheConfig,
    ids: Vec<String>,
    priority: i64,
) -> anyhow::Result<()> {
    let cache = ReadThroughCache::with_config(store, config, None, BytesCodec).await?;

    let results = join_all(ids.iter().map(|id| cache.warm(priority, id))).await;
    cache.shutdown().await;

    let mut failed = 0;
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(()) => println!("{id}\tok"),
            Err(e) => {
                warn!(id = %id, "warm failed: {e}");
                println!("{id}\terror\t{e}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} ids failed", ids.len());
    }
    Ok(())
}

async fn cmd_status(store: Arc<dyn Store>, config: CacheConfig, limit: usize) -> anyhow::Result<()> {
    let queue = rtcache::queue::TaskQueue::new(store, &config.queue_name);

    let pending = queue.pending().await?;
    let queued = queue.queued(limit).await?;
    let in_progress = queue.in_progress().await?;

    println!("queue:       {}", queue.name());
    println!("pending:     {pending}");
    println!("in progress: {}", in_progress.len());
    if !queued.is_empty() {
        println!("\nnext up:");
        for id in &queued {
            println!("  {id}");
        }
    }
    if !in_progress.is_empty() {
        println!("\ncomputing:");
        for id in &in_progress {
            println!("  {id}");
        }
    }
    Ok(())
}
