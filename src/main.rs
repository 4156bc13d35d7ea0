//! freecoin node CLI
//!
//! Runs a P2P node and manages its local state.

use clap::{Parser, Subcommand, ValueEnum};
use freecoin::cli::{self, CliResult};
use freecoin::network::{AlertObject, NetworkConfig, PeerAddress, DEFAULT_PORT};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "freecoin")]
#[command(version = "0.1.0")]
#[command(about = "freecoin peer-to-peer node", long_about = None)]
struct Cli {
    /// Data directory for the known-peers file and the admin key
    #[arg(short, long, default_value = ".freecoin")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// P2P node operations
    Node {
        #[command(subcommand)]
        action: NodeCommands,
    },

    /// Known-peers management
    Peers {
        #[command(subcommand)]
        action: PeersCommands,
    },

    /// Generate the admin key used to sign alerts
    Keygen {
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },

    /// Send a signed alert to a node
    Alert {
        /// What the receiving client should do
        #[arg(short, long, value_enum, default_value = "warn")]
        kind: AlertKind,

        /// Alert type byte
        #[arg(long, default_value = "0")]
        alert_type: u8,

        /// Alert text (ASCII, at most 255 bytes)
        #[arg(short, long)]
        message: String,

        /// Node to deliver the alert to (host:port)
        #[arg(short, long)]
        peer: PeerAddress,
    },
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Start the P2P node
    Start {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Interface to listen on
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        /// Extra peers to connect to (host:port, repeatable)
        #[arg(long = "peer")]
        peers: Vec<PeerAddress>,
    },
}

#[derive(Subcommand)]
enum PeersCommands {
    /// List known peers
    List,

    /// Add a known peer
    Add {
        /// Peer address (host:port)
        peer: PeerAddress,
    },

    /// Remove a known peer
    Remove {
        /// Peer address (host:port)
        peer: PeerAddress,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AlertKind {
    Warn,
    ForceUpdate,
}

impl From<AlertKind> for AlertObject {
    fn from(kind: AlertKind) -> Self {
        match kind {
            AlertKind::Warn => AlertObject::WarnUser,
            AlertKind::ForceUpdate => AlertObject::ForceUpdate,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Node { action } => run_node_command(action, cli.data_dir),
        Commands::Peers { action } => match action {
            PeersCommands::List => cli::cmd_peers_list(&cli.data_dir),
            PeersCommands::Add { peer } => cli::cmd_peers_add(&cli.data_dir, &peer),
            PeersCommands::Remove { peer } => cli::cmd_peers_remove(&cli.data_dir, &peer),
        },
        Commands::Keygen { force } => cli::cmd_keygen(&cli.data_dir, force),
        Commands::Alert {
            kind,
            alert_type,
            message,
            peer,
        } => {
            let config = NetworkConfig {
                data_dir: cli.data_dir,
                ..Default::default()
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_alert(
                config,
                &peer,
                alert_type,
                kind.into(),
                &message,
            ))
        }
    }
}

fn run_node_command(action: NodeCommands, data_dir: PathBuf) -> CliResult<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        match action {
            NodeCommands::Start { port, bind, peers } => {
                let config = NetworkConfig {
                    port,
                    bind_addr: bind,
                    data_dir,
                    ..Default::default()
                };
                cli::cmd_node_start(config, &peers).await
            }
        }
    })
}
