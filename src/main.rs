// geohop - command line for a GeoHop ledger node
//
// Key management and read-only inspection of a node data directory, plus an
// in-process mesh simulation over the simulated radio medium.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use geohop::api::{LedgerNode, LedgerNodeConfig, NodeRuntime, RuntimeConfig};
use geohop::config::NodeConfig;
use geohop::identity::{Keypair, NodeId};
use geohop::ledger::{Amount, LedgerPolicy};
use geohop::storage::{MemoryStore, SledStore};
use geohop::sync::GossipConfig;
use geohop::transport::{
    LoraTransport, LoraTransportConfig, MeshAdapter, MeshAdapterConfig, RadioMedium, SimulatedRadio,
};
use rand::Rng;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geohop", about = "GeoHop ledger node over LoRa mesh", version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a node key and store it in the data directory
    Keygen,
    /// Restore a node key from its 24-word mnemonic
    Restore {
        #[arg(long)]
        mnemonic: String,
    },
    /// List every known account
    Accounts,
    /// Show one account's balance
    Balance { node_id: String },
    /// Show the committed history of one account
    History { node_id: String },
    /// Run an in-process mesh of nodes over a simulated radio medium
    Simulate {
        #[arg(long, default_value_t = 4)]
        nodes: usize,
        #[arg(long, default_value_t = 10)]
        rounds: usize,
        /// Percentage of radio deliveries lost
        #[arg(long, default_value_t = 0)]
        loss: u8,
    },
}

type CliResult<T> = Result<T, Box<dyn Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_toml_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    match cli.command {
        Command::Keygen => keygen(&config, Keypair::generate()),
        Command::Restore { mnemonic } => keygen(&config, Keypair::from_mnemonic(&mnemonic)?),
        Command::Accounts => accounts(&config).await,
        Command::Balance { node_id } => balance(&config, node_id.parse()?).await,
        Command::History { node_id } => history(&config, node_id.parse()?).await,
        Command::Simulate { nodes, rounds, loss } => simulate(nodes.max(2), rounds, loss).await,
    }
}

fn keygen(config: &NodeConfig, keypair: Keypair) -> CliResult<()> {
    let store = SledStore::open(&config.data_dir)?;
    if store.load_keypair()?.is_some() {
        return Err(format!("{} already holds a node key", config.data_dir.display()).into());
    }
    store.save_keypair(&keypair)?;
    let node_id = NodeId::from_public_key(&keypair.public_key());
    println!("node id:    {node_id}");
    println!("handle:     {}", node_id.short());
    println!("public key: {}", hex::encode(keypair.public_key().as_bytes()));
    println!("mnemonic:   {}", keypair.to_mnemonic()?);
    Ok(())
}

fn open_node(config: &NodeConfig) -> CliResult<LedgerNode> {
    let (node, _outbound) =
        LedgerNode::open(&config.data_dir, config.policy()?, config.node_config())?;
    Ok(node)
}

async fn accounts(config: &NodeConfig) -> CliResult<()> {
    let node = open_node(config)?;
    for account in node.accounts().await {
        let name = if account.display_name().is_empty() {
            "-"
        } else {
            account.display_name()
        };
        println!(
            "{:<11} {:<16} {:>18} HOP{}",
            account.node_id().short(),
            name,
            account.balance(),
            if account.is_banned() { "  [banned]" } else { "" }
        );
    }
    let stats = node.stats().await;
    println!("{} accounts, {} issued", stats.accounts, stats.issued_supply);
    Ok(())
}

async fn balance(config: &NodeConfig, node_id: NodeId) -> CliResult<()> {
    let node = open_node(config)?;
    println!("{} {} HOP", node_id.short(), node.get_balance(&node_id).await);
    Ok(())
}

async fn history(config: &NodeConfig, node_id: NodeId) -> CliResult<()> {
    let node = open_node(config)?;
    for tx in node.get_history(&node_id).await {
        let id = tx.id();
        let received = node
            .received_at(&id)
            .await
            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(i64::try_from(ms).ok()?))
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{}  {:<12} {:>18} HOP -> {}  [{}]",
            received,
            tx.kind().name(),
            tx.amount(),
            tx.recipient().short(),
            id.short()
        );
    }
    Ok(())
}

struct SimNode {
    keypair: Keypair,
    runtime: NodeRuntime<LoraTransport<SimulatedRadio>>,
}

async fn simulate(count: usize, rounds: usize, loss: u8) -> CliResult<()> {
    let medium = RadioMedium::new();
    medium.set_loss_percent(loss);
    let authority = Keypair::generate();
    let policy = LedgerPolicy::new()
        .with_genesis_authority(authority.public_key())
        .with_admin(authority.public_key());
    let node_config =
        LedgerNodeConfig::new().with_gossip(GossipConfig::new().with_gossip_interval(1_000));

    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        let keypair = if i == 0 {
            Keypair::from_bytes(&authority.to_bytes())?
        } else {
            Keypair::generate()
        };
        let device = u32::try_from(i + 1)?;
        let transport = LoraTransport::new(
            LoraTransportConfig::new().with_device_id(device),
            medium.attach(device),
        );
        let mesh = MeshAdapter::new(transport, MeshAdapterConfig::default())?;
        let (node, outbound) = LedgerNode::new(
            Keypair::from_bytes(&keypair.to_bytes())?,
            policy.clone(),
            Box::new(MemoryStore::new()),
            node_config.clone(),
        )?;
        let (mut runtime, _shutdown) =
            NodeRuntime::new(Arc::new(node), mesh, outbound, RuntimeConfig::default());
        runtime.start().await?;
        nodes.push(SimNode { keypair, runtime });
    }

    for (i, sim) in nodes.iter().enumerate() {
        sim.runtime.node().register(&format!("node-{i}")).await?;
    }
    let authority_node = Arc::clone(nodes[0].runtime.node());
    for sim in &nodes {
        let id = NodeId::from_public_key(&sim.keypair.public_key());
        authority_node.mint_genesis(id, Amount::from_hop(100)).await?;
    }
    settle(&mut nodes).await;

    let mut rng = rand::thread_rng();
    for round in 0..rounds {
        let from = rng.gen_range(0..count);
        let to = (from + rng.gen_range(1..count)) % count;
        let amount = Amount::from_hop(rng.gen_range(1..=20));
        let recipient = NodeId::from_public_key(&nodes[to].keypair.public_key());
        match nodes[from].runtime.node().submit_transfer(recipient, amount).await {
            Ok(id) => info!(round, from, to, %amount, tx = %id.short(), "transfer"),
            Err(e) => info!(round, from, to, %amount, error = %e, "transfer refused"),
        }
        settle(&mut nodes).await;
    }

    let reference = nodes[0].runtime.node().digest().await;
    println!("{:<6} {:<11} {:>18}  converged", "node", "handle", "balance");
    for (i, sim) in nodes.iter().enumerate() {
        let node = sim.runtime.node();
        let converged = node.digest().await.matches(&reference);
        println!(
            "{:<6} {:<11} {:>18}  {}",
            i,
            node.node_id().short(),
            node.get_balance(&node.node_id()).await,
            converged
        );
    }
    println!("radio: {} delivered, {} lost", medium.delivered(), medium.lost());
    Ok(())
}

/// Gossip and step every node until the mesh goes quiet
async fn settle(nodes: &mut [SimNode]) {
    for _ in 0..3 {
        for sim in nodes.iter_mut() {
            sim.runtime.gossip().await;
        }
        for _ in 0..16 {
            let mut idle = true;
            for sim in nodes.iter_mut() {
                idle &= sim.runtime.step().await.is_idle();
            }
            if idle {
                break;
            }
        }
    }
}
