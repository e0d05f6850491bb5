use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wflib::{
    Config, GitStorage, ListenerRegistry, PushGateway, RepositoryListener, StaticAccessControl,
    WflibServer,
};
use wflib_git::refs::Ref;

#[derive(Parser)]
#[command(name = "wflib")]
#[command(about = "Workflow library repository served over git smart HTTP", long_about = None)]
struct Cli {
    /// Config file (default: ~/.wflib/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data root; overrides storage.data_dir from the config
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the repository
    Start {
        /// Bind address; overrides server.bind_address
        #[arg(long)]
        addr: Option<String>,
    },
    /// Create the repository if it does not exist yet
    Init,
    /// Print where the repository lives
    Path,
    /// List the repository's refs
    Refs,
}

/// Logs the branch heads after every push
struct RefLogListener {
    root: PathBuf,
}

impl RepositoryListener for RefLogListener {
    fn repository_updated(&self) -> Result<()> {
        let storage = GitStorage::open(&self.root)?;
        for named in storage.list_refs()? {
            if let Ref::Direct(oid) = named.reference {
                info!(ref_name = %named.name, %oid, "repository updated");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "ref-log"
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) if path.exists() => Config::load_from(path),
        Some(path) => {
            let config = Config::default();
            config
                .save_to(path)
                .with_context(|| format!("Failed to write default config to {}", path.display()))?;
            Ok(config)
        }
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wflib=info,wflib_git=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.storage.data_dir));

    let accounts = Arc::new(StaticAccessControl::from_config(&config.auth));
    let listeners = Arc::new(ListenerRegistry::new());
    let gateway = Arc::new(PushGateway::new(&data_dir, accounts.clone(), listeners.clone()));

    match cli.command {
        Commands::Start { addr } => {
            let addr = addr.unwrap_or_else(|| config.server.bind_address.clone());
            listeners.register(Arc::new(RefLogListener {
                root: gateway.resolve_repository_root(),
            }));

            if !config.auth.users.iter().any(|u| u.admin) {
                warn!("no administrator configured under [auth]; pushes will be refused");
            }

            println!("Starting wflib on {}", addr);
            println!("Data directory: {}", data_dir.display());
            println!("Repository: {}", gateway.resolve_repository_root().display());
            println!("Git remote: http://{}/{}", addr, config.server.url_name);

            WflibServer::new(gateway, addr)
                .with_accounts(accounts)
                .with_url_name(config.server.url_name.clone())
                .run()
                .await?;
        }
        Commands::Init => {
            gateway
                .ensure_repository_initialized()
                .context("Failed to initialize repository")?;
            println!("Repository: {}", gateway.resolve_repository_root().display());
        }
        Commands::Path => {
            println!("{}", gateway.resolve_repository_root().display());
        }
        Commands::Refs => match gateway.open_repository()? {
            None => println!(
                "No repository at {} (created on first push)",
                gateway.resolve_repository_root().display()
            ),
            Some(storage) => {
                let refs = storage.list_refs()?;
                if refs.is_empty() {
                    println!("Repository is empty");
                }
                for named in refs {
                    match named.reference {
                        Ref::Direct(oid) => println!("{} {}", oid, named.name),
                        Ref::Symbolic(target) => println!("-> {} {}", target, named.name),
                    }
                }
            }
        },
    }

    Ok(())
}
