use clap::{Parser, Subcommand, ValueEnum};
use forkpool_apiserver::{ApiServer, AppState, Config as ApiConfig};
use forkpool_core::NamingScheme;
use forkpool_engine::{MockStorageEngine, StorageEngine, ZfsConfig, ZfsStorageEngine};
use forkpool_manager::{
    CacheBranchManager, DestroyPolicy, ManagerConfig, PromotionJournal, RetryPolicy,
    SiblingPolicy,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "forkpool", about = "Copy-on-write build caches and branches")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "FORKPOOL_LOG_FORMAT", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum EngineKind {
    /// `zfs` command line tool
    Zfs,
    /// In-memory engine, state is lost on exit
    Mock,
}

#[derive(clap::Args)]
struct EngineArgs {
    /// Pool root dataset holding the caches and branches trees
    #[arg(long, env = "FORKPOOL_POOL")]
    pool: String,
    /// Storage engine backend
    #[arg(long, value_enum, default_value_t = EngineKind::Zfs, env = "FORKPOOL_ENGINE")]
    engine: EngineKind,
    /// Path to the zfs binary
    #[arg(long, default_value = "zfs", env = "FORKPOOL_ZFS_BIN")]
    zfs_bin: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:7070", env = "FORKPOOL_BIND")]
        bind: String,
        #[command(flatten)]
        engine: EngineArgs,
        /// Upper bound for each storage engine call
        #[arg(long, default_value_t = 60, env = "FORKPOOL_COMMAND_TIMEOUT_SECS")]
        command_timeout_secs: u64,
        /// Attempts for listing, snapshot and clone calls
        #[arg(long, default_value_t = 3, env = "FORKPOOL_RETRIES")]
        retries: u32,
        /// What happens to other branches when one is promoted (destroy, retain)
        #[arg(long, default_value = "destroy", env = "FORKPOOL_SIBLING_POLICY")]
        sibling_policy: SiblingPolicy,
        /// What destroying a cache with branches does (reject, cascade)
        #[arg(long, default_value = "reject", env = "FORKPOOL_DESTROY_POLICY")]
        destroy_policy: DestroyPolicy,
        /// Directory for promotion checkpoints
        #[arg(long, env = "FORKPOOL_JOURNAL_DIR")]
        journal_dir: Option<PathBuf>,
    },
    /// Create the caches and branches roots
    Init {
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// List promotions that did not finish
    Pending {
        /// Directory for promotion checkpoints
        #[arg(long, env = "FORKPOOL_JOURNAL_DIR")]
        journal_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_format);

    match cli.command {
        Commands::Serve {
            bind,
            engine,
            command_timeout_secs,
            retries,
            sibling_policy,
            destroy_policy,
            journal_dir,
        } => {
            let config = ManagerConfig {
                command_timeout: Duration::from_secs(command_timeout_secs),
                retry: RetryPolicy {
                    attempts: retries,
                    ..RetryPolicy::default()
                },
                sibling_policy,
                destroy_policy,
            };
            run_serve(&bind, &engine, config, journal_dir).await
        }
        Commands::Init { engine } => run_init(&engine).await,
        Commands::Pending { journal_dir } => run_pending(journal_dir).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Run the API server until ctrl-c
async fn run_serve(
    bind: &str,
    engine_args: &EngineArgs,
    config: ManagerConfig,
    journal_dir: Option<PathBuf>,
) -> miette::Result<()> {
    info!("Starting forkpool API server");

    let listen_addr: std::net::SocketAddr = bind
        .parse()
        .map_err(|e| miette::miette!("Invalid bind address '{}': {}", bind, e))?;

    let journal = match journal_dir {
        Some(dir) => PromotionJournal::open(dir).await?,
        None => PromotionJournal::disabled(),
    };

    let manager = create_manager(engine_args, config)?.with_journal(journal);
    manager.initialize().await?;

    for record in manager.pending_promotions().await? {
        warn!(
            promotion = %record.id,
            "Unfinished promotion of {} into {} stopped at {}",
            record.branch_path,
            record.cache_path,
            record.phase
        );
    }

    let token = CancellationToken::new();
    let server = ApiServer::new(
        ApiConfig { listen_addr },
        Arc::new(AppState::new(manager)),
    );
    let server_token = token.clone();
    let server_handle = tokio::spawn(async move {
        server
            .run(async move { server_token.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    server_handle
        .await
        .map_err(|e| miette::miette!("API server task failed: {}", e))?
        .map_err(|e| miette::miette!("API server error: {}", e))?;

    info!("Shutdown complete");
    Ok(())
}

async fn run_init(engine_args: &EngineArgs) -> miette::Result<()> {
    let manager = create_manager(engine_args, ManagerConfig::default())?;
    manager.initialize().await?;
    info!("Pool {} initialized", manager.naming().pool());
    Ok(())
}

async fn run_pending(journal_dir: PathBuf) -> miette::Result<()> {
    let journal = PromotionJournal::open(journal_dir).await?;
    let pending = journal.pending().await?;

    if pending.is_empty() {
        info!("No unfinished promotions");
        return Ok(());
    }
    for record in pending {
        println!(
            "{}  {}  {} -> {}  phase={}",
            record.id,
            record
                .started_at()
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            record.branch_path,
            record.cache_path,
            record.phase
        );
    }
    Ok(())
}

fn create_manager(
    engine_args: &EngineArgs,
    config: ManagerConfig,
) -> miette::Result<CacheBranchManager> {
    let naming = NamingScheme::new(&engine_args.pool)?;

    let engine: Arc<dyn StorageEngine> = match engine_args.engine {
        EngineKind::Zfs => {
            info!("Using ZFS storage engine ({})", engine_args.zfs_bin);
            Arc::new(ZfsStorageEngine::new(ZfsConfig {
                binary: engine_args.zfs_bin.clone(),
            }))
        }
        EngineKind::Mock => {
            warn!("Using in-memory storage engine; nothing is persisted");
            Arc::new(MockStorageEngine::new(naming.pool()))
        }
    };

    Ok(CacheBranchManager::new(engine, naming, config))
}
