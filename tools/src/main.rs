//! Main binary of an ISAAC node. It reads the configuration, initializes the
//! storage and runs the node executor.
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use isaac_bft::genesis;
use isaac_crypto::TextFmt as _;
use isaac_executor::Executor;
use isaac_roles::{messages::Height, node::SecretKey};
use isaac_storage::localfs::LocalFs;
use isaac_tools::{localnet::Localnet, store::RocksDB, AppConfig};
use std::{
    fs,
    io::IsTerminal as _,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};
use vise_exporter::MetricsExporter;
use zksync_concurrency::{ctx, error::Wrap as _, scope};

/// Command-line application of an ISAAC node.
#[derive(Debug, Parser)]
#[command(name = "isaac", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generates a node key pair and prints it to stdout.
    Keygen,
    /// Creates the pre-genesis and genesis blocks. Run it on a single node;
    /// the other nodes fetch the blocks from it.
    Init {
        /// Path to a JSON file with node configuration.
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
    },
    /// Runs a node.
    Run {
        /// Path to a JSON file with node configuration.
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
    },
    /// Runs a network of nodes within this process.
    Localnet {
        /// Number of nodes.
        #[arg(long, default_value_t = 4)]
        nodes: usize,
        /// Stop once every node has committed a block at this height.
        #[arg(long, default_value_t = 10)]
        blocks: i64,
        /// Directory for the block data of the nodes.
        #[arg(long, default_value = "localnet")]
        data_dir: PathBuf,
    },
}

/// Installs the stdout logger, plus a file logger if `log_file` is set.
fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    // Human-readable logs, filtered by `RUST_LOG`.
    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_ansi(std::env::var("NO_COLOR").is_err() && std::io::stdout().is_terminal())
        .with_file(false)
        .with_line_number(false)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );

    // Machine-readable logs of level DEBUG or higher.
    let file_log = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("create_dir_all({})", dir.display()))?;
            }
            let file = fs::File::create(path)
                .with_context(|| format!("File::create({})", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(file)
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    let subscriber = Registry::default().with(stdout_log).with(file_log);
    tracing::subscriber::set_global_default(subscriber).context("set_global_default()")
}

#[allow(clippy::print_stdout)]
fn keygen() {
    let key = SecretKey::generate();
    println!("{}", key.encode());
    println!("{}", key.public().encode());
}

async fn open_storage(config: &AppConfig) -> anyhow::Result<(Arc<RocksDB>, Arc<LocalFs>)> {
    let db = RocksDB::open(&config.database_path())
        .await
        .wrap("RocksDB::open()")?;
    let block_data = LocalFs::open(&config.block_data_path()).context("LocalFs::open()")?;
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        network_id = %config.network_id,
        "ISAAC node - storage opened"
    );
    Ok((Arc::new(db), Arc::new(block_data)))
}

async fn init(ctx: &ctx::Ctx, config: &AppConfig) -> anyhow::Result<()> {
    let (db, block_data) = open_storage(config).await?;
    let g = genesis::generate(ctx, &config.local(), &config.policy(), db, block_data, vec![])
        .await
        .wrap("genesis::generate()")?;
    tracing::info!(
        pre_genesis = %g.pre_genesis.hash(),
        genesis = %g.genesis.hash(),
        "ISAAC node - genesis created"
    );
    Ok(())
}

async fn run(ctx: &ctx::Ctx, config: &AppConfig) -> anyhow::Result<()> {
    let (db, block_data) = open_storage(config).await?;
    let executor = Executor::new(
        config.executor_config(),
        db,
        block_data,
        Arc::new(config.transport()),
    )
    .context("Executor::new()")?;
    let metrics_server_addr = config.metrics_server_addr;
    scope::run!(ctx, |ctx, s| async {
        if let Some(addr) = metrics_server_addr {
            s.spawn_bg(async move {
                MetricsExporter::default()
                    .with_graceful_shutdown(ctx.canceled())
                    .start(addr)
                    .await
                    .context("MetricsExporter")?;
                Ok(())
            });
        }
        tracing::info!(address = %config.address, "ISAAC node - starting");
        executor.run(ctx).await?;
        Ok(())
    })
    .await
    .context("node stopped")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let ctx = &ctx::root();
    match args.command {
        Command::Keygen => {
            keygen();
            Ok(())
        }
        Command::Init { config } => {
            let config = AppConfig::read(&config).context("AppConfig::read()")?;
            init_logging(None)?;
            init(ctx, &config).await
        }
        Command::Run { config } => {
            let config = AppConfig::read(&config).context("AppConfig::read()")?;
            init_logging(Some(&config.log_path()))?;
            run(ctx, &config).await
        }
        Command::Localnet {
            nodes,
            blocks,
            data_dir,
        } => {
            init_logging(None)?;
            let manifests = Localnet::new(nodes, data_dir)
                .run(ctx, Height(blocks))
                .await?;
            anyhow::ensure!(
                manifests.windows(2).all(|w| w[0] == w[1]),
                "nodes disagree on block {blocks}"
            );
            tracing::info!(%blocks, "ISAAC localnet - every node agrees");
            Ok(())
        }
    }
}
