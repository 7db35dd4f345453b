use abcast::{CallbackHandler, DaemonConfig, Error, Journal, Node, NodeId, Round};
use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "abcastd")]
#[command(about = "Atomic broadcast daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(short, long, default_value = "abcastd.toml")]
        config: PathBuf,
    },
    Init {
        #[arg(short, long, default_value = "abcastd.toml")]
        config: PathBuf,
    },
}

/// Persists every delivered round before confirming it.
struct JournalHandler {
    journal: Arc<Journal>,
}

#[async_trait]
impl CallbackHandler for JournalHandler {
    async fn on_append(&self, node: &Node, round: Round, payload: Vec<u8>) {
        match self.journal.store(round, &payload) {
            Ok(()) => node.confirm(round),
            Err(e) => error!("failed to journal round {}: {}", round, e),
        }
    }

    async fn on_commit(&self, _node: &Node, round: Round) {
        // The leader's own rounds are journaled once `propose` returns.
        match self.journal.commit_stored(round) {
            Ok(Some(payload)) => print_round(round, &payload),
            Ok(None) => debug!("round {} not newly committed in the journal", round),
            Err(e) => warn!("failed to record commit of round {}: {}", round, e),
        }
    }

    async fn gained_leadership(&self, node: &Node) {
        info!("node {} is now the leader", node.id());
    }

    async fn lost_leadership(&self, node: &Node) {
        info!("node {} is no longer the leader", node.id());
    }

    async fn on_leader_change(&self, node: &Node, leader: Option<NodeId>) {
        match leader {
            Some(leader) => info!("node {} follows leader {}", node.id(), leader),
            None => info!("node {} has no known leader", node.id()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "abcast=info,abcastd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config: config_path } => {
            run_daemon(config_path).await?;
        }
        Commands::Init { config: config_path } => {
            init_config(config_path)?;
        }
    }

    Ok(())
}

async fn run_daemon(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        info!("Loading config from {:?}", config_path);
        DaemonConfig::load(&config_path)?
    } else {
        info!("Config file not found, using defaults");
        DaemonConfig::default()
    };
    let key = config.shared_key()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let journal = Arc::new(Journal::open(config.journal_path())?);
    info!(
        "Journal at {:?} holds {} rounds up to round {}, committed through {}",
        config.journal_path(),
        journal.len(),
        journal.last_round()?,
        journal.committed()?
    );

    let handler = JournalHandler {
        journal: journal.clone(),
    };
    let node = Node::with_config(
        config.node_id,
        &config.listen_addr,
        config.cluster_size,
        handler,
        config.engine.clone(),
    )
    .await?;
    node.set_key(key)?;
    for peer in &config.peers {
        node.add_peer(peer).await?;
    }

    let runner = node.clone();
    let run_handle = tokio::spawn(async move {
        match runner.run().await {
            Err(Error::Lifecycle(_)) => debug!("Processing loop finished"),
            Err(e) => error!("Processing loop failed: {}", e),
            Ok(()) => {}
        }
    });

    let proposer = node.clone();
    let proposer_journal = journal.clone();
    let stdin_handle = tokio::spawn(async move {
        if let Err(e) = propose_stdin(proposer, proposer_journal).await {
            error!("stdin proposer stopped: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    node.destroy()?;
    stdin_handle.abort();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), run_handle).await;
    journal.flush()?;

    Ok(())
}

/// Proposes each line read from stdin while this node leads.
async fn propose_stdin(node: Node, journal: Arc<Journal>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        if !node.is_leader() {
            warn!("not the leader (leader is {:?}), dropping input", node.leader_id());
            continue;
        }

        match node.propose(line.clone().into_bytes()).await {
            Ok(round) => {
                journal.store(round, line.as_bytes())?;
                if let Some(payload) = journal.commit_stored(round)? {
                    print_round(round, &payload);
                }
            }
            Err(e) if e.is_transient() => warn!("proposal failed, retry later: {}", e),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn print_round(round: Round, payload: &[u8]) {
    println!("{}\t{}", round, String::from_utf8_lossy(payload));
}

fn init_config(config_path: PathBuf) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Config file already exists: {:?}", config_path);
    }

    let config = DaemonConfig::default();
    config.save(&config_path)?;
    println!("Created config file: {:?}", config_path);
    println!("\nEdit the config file to:");
    println!("  - Set a unique node_id and listen_addr");
    println!("  - Set cluster_size and list the other members under peers");
    println!("  - Export the shared key in ${}", config.key_env);

    Ok(())
}
