use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use common::WorkerId;
use common::config::DEFAULT_CONFIG_PATH;
use libbootres::CommitOutcome;
use rackd::{commands, daemon, migrate::LEGACY_PATHS};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rackd", version, about = "MAAS rack controller daemon")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "RACKD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, env = "RACKD_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, edit or print the configuration file
    Config(ConfigArgs),
    /// Install the shared secret used to authenticate with the region
    InstallSharedSecret {
        /// Hex-encoded secret, read from stdin if omitted
        #[arg(long)]
        secret: Option<String>,
        /// Generate a random secret if none is installed and print it
        #[arg(long, conflicts_with = "secret")]
        generate: bool,
    },
    /// Migrate legacy cluster configuration files
    UpgradeCluster {
        /// Legacy files to migrate instead of the default locations
        #[arg(value_name = "FILE")]
        legacy: Vec<PathBuf>,
    },
    #[command(subcommand)]
    Workers(WorkersCommand),
    /// Import a directory of boot resources as a new generation
    ImportResources {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// List committed boot resource generations
    Generations,
    /// Run the rack controller
    Daemon,
}

#[derive(Args)]
#[group(required = true, multiple = true)]
struct ConfigArgs {
    /// Create the file with a new cluster UUID and the default workers
    #[arg(long)]
    init: bool,
    #[arg(long, value_name = "URL")]
    region_url: Option<String>,
    #[arg(long, value_name = "UUID")]
    uuid: Option<String>,
    /// Print the configuration
    #[arg(long)]
    show: bool,
}

/// Enable or disable region workers
#[derive(Subcommand)]
enum WorkersCommand {
    Enable { id: u32 },
    Disable { id: u32 },
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.config.as_path();
    match cli.command {
        Commands::Config(args) => {
            if args.init {
                println!("config --init: {}", commands::config_init(config)?);
            }
            if let Some(url) = args.region_url {
                println!("config --region-url: {}", commands::config_set_region_url(config, &url)?);
            }
            if let Some(uuid) = args.uuid {
                println!("config --uuid: {}", commands::config_set_uuid(config, &uuid)?);
            }
            if args.show {
                print!("{}", commands::config_show(config)?);
            }
        }
        Commands::InstallSharedSecret { generate: true, .. } => {
            let (outcome, hex) = commands::generate_shared_secret(config)?;
            println!("{outcome}");
            println!("{hex}");
        }
        Commands::InstallSharedSecret { secret, .. } => {
            let secret = match secret {
                Some(s) => s,
                None => {
                    let mut line = String::new();
                    std::io::stdin()
                        .lock()
                        .read_line(&mut line)
                        .context("failed to read the secret from stdin")?;
                    line
                }
            };
            println!("{}", commands::install_shared_secret(config, secret.trim())?);
        }
        Commands::UpgradeCluster { legacy } => {
            let legacy = if legacy.is_empty() {
                LEGACY_PATHS.iter().map(PathBuf::from).collect()
            } else {
                legacy
            };
            for (path, outcome) in commands::upgrade_cluster(config, &legacy)? {
                println!("{}: {outcome}", path.display());
            }
        }
        Commands::Workers(WorkersCommand::Enable { id }) => {
            println!("{}", commands::workers_enable(config, WorkerId(id))?);
        }
        Commands::Workers(WorkersCommand::Disable { id }) => {
            println!("{}", commands::workers_disable(config, WorkerId(id))?);
        }
        Commands::Workers(WorkersCommand::List) => {
            for id in commands::workers_list(config)? {
                println!("{id}");
            }
        }
        Commands::ImportResources { dir } => match commands::import_resources(config, &dir).await? {
            CommitOutcome::Verified(id) => println!("changed: generation {id} is now current"),
            CommitOutcome::Failed(reason) => anyhow::bail!("import failed: {reason}"),
        },
        Commands::Generations => {
            for generation in commands::generations(config).await? {
                println!("{generation}");
            }
        }
        Commands::Daemon => {
            info!(config = %config.display(), "Starting rackd");
            daemon::run(config, shutdown_signal()).await?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
