use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tidemark::server::{self, ServerOptions};

/// Tidemark storage server.
#[derive(Debug, Parser)]
#[command(name = "tidemark", version, about)]
struct Args {
    /// Root path for record logs and indexed store files.
    #[arg(long, env = "TIDEMARK_DATA_DIRECTORY", default_value = "data")]
    data_directory: std::path::PathBuf,

    /// Record log rotation threshold in MiB.
    #[arg(long, env = "TIDEMARK_RECORDLOG_MAX_LOG_SIZE_MB", default_value_t = 100)]
    recordlog_max_log_size_mb: u64,

    /// Cluster/retention configuration file (JSON), watched for changes.
    #[arg(long, env = "TIDEMARK_CONFIG_FILE")]
    config_file: Option<std::path::PathBuf>,

    /// Address to listen on; 0.0.0.0 listens on any address.
    #[arg(long, env = "TIDEMARK_LISTEN_ADDRESS", default_value = "0.0.0.0")]
    listen_address: String,

    /// HTTP port.
    #[arg(long, env = "TIDEMARK_PORT", default_value_t = 8020)]
    port: u16,

    /// Worker threads for the request pool; 0 uses the core count.
    #[arg(long, env = "TIDEMARK_NUM_THREADS", default_value_t = 0)]
    num_threads: usize,

    /// Advisory RAM budget for cached store objects, in MiB.
    #[arg(long, env = "TIDEMARK_STORE_MAX_RAM_MB", default_value_t = 200)]
    store_max_ram_mb: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "tidemark",
        "tidemark starting: RUST_LOG='{}', listen={}:{}, data_directory='{}', num_threads={}",
        rust_log,
        args.listen_address,
        args.port,
        args.data_directory.display(),
        args.num_threads
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if args.num_threads > 0 {
        builder.worker_threads(args.num_threads);
    }
    let runtime = builder.build()?;

    runtime.block_on(server::run(ServerOptions {
        data_directory: args.data_directory,
        config_file: args.config_file,
        listen_address: args.listen_address,
        port: args.port,
        recordlog_max_log_size_mb: args.recordlog_max_log_size_mb,
        store_max_ram_mb: args.store_max_ram_mb,
    }))
}
