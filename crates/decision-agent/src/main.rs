//! # decision-agent
//!
//! why: run one consensus node of the decision cluster, or talk to a running one
//! relations: embeds decision-cluster's NodeHandle and Gateway; clients share its tcp transport
//! what: clap cli (run, submit, outcome, status, join, leave), logging setup

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use decision_cluster::{
    transport, Gateway, GovernanceMachine, NodeConfig, NodeHandle, Request, Response, TcpTransport, Transport,
};
use decision_core::{LogIndex, MembershipChange, NodeId};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Multi-agent decision consensus node
#[derive(Parser, Debug)]
#[command(name = "decision-agent")]
#[command(about = "Raft-replicated decision log for cooperating agents", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until interrupted
    Run {
        /// TOML config file; DECISION_* env vars override it
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        node_id: Option<NodeId>,

        #[arg(long)]
        listen_addr: Option<String>,

        /// Log directory; omit to keep the log in memory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Start outside the roster and wait to be added
        #[arg(long)]
        join: bool,
    },
    /// Submit a decision command (JSON) to a node
    Submit {
        #[arg(long)]
        node: String,

        #[arg(long)]
        command: String,

        #[arg(long)]
        dedup_key: Option<String>,
    },
    /// Look up the outcome applied at a log index
    Outcome {
        #[arg(long)]
        node: String,

        #[arg(long)]
        index: LogIndex,
    },
    /// Show a node's role, term, commit progress and liveness view
    Status {
        #[arg(long)]
        node: String,
    },
    /// Add a member through a committed configuration change
    Join {
        #[arg(long)]
        node: String,

        #[arg(long)]
        id: NodeId,

        #[arg(long)]
        address: String,
    },
    /// Remove a member through a committed configuration change
    Leave {
        #[arg(long)]
        node: String,

        #[arg(long)]
        id: NodeId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::Run { config, node_id, listen_addr, data_dir, join } => {
            let mut config = NodeConfig::load(config.as_deref())?;
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            if let Some(listen_addr) = listen_addr {
                config.listen_addr = listen_addr;
            }
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            config.join |= join;
            config.validate()?;
            run(config).await
        }
        Command::Submit { node, command, dedup_key } => {
            let command: serde_json::Value =
                serde_json::from_str(&command).context("--command must be valid JSON")?;
            print(call(&node, Request::Submit { command, dedup_key, forwarded: false }).await?)
        }
        Command::Outcome { node, index } => print(call(&node, Request::Outcome { index }).await?),
        Command::Status { node } => print(call(&node, Request::Status).await?),
        Command::Join { node, id, address } => {
            let change = MembershipChange::Join { node_id: id, address };
            print(call(&node, Request::Membership { change, forwarded: false }).await?)
        }
        Command::Leave { node, id } => {
            let change = MembershipChange::Leave { node_id: id };
            print(call(&node, Request::Membership { change, forwarded: false }).await?)
        }
    }
}

async fn run(config: NodeConfig) -> Result<()> {
    tracing::info!(
        node = config.node_id,
        listen = %config.listen_addr,
        members = config.members.len(),
        data_dir = ?config.data_dir,
        "starting decision agent"
    );

    let store = config.open_store().context("failed to open log store")?;
    let transport = Arc::new(TcpTransport::new());
    let node = NodeHandle::spawn(&config, store, Box::new(GovernanceMachine::new()), transport.clone());
    let gateway = Gateway::new(node.clone(), transport);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let server = transport::serve(listener, Arc::new(gateway));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    server.abort();
    node.shutdown().await;
    Ok(())
}

async fn call(node: &str, request: Request) -> Result<Response> {
    // clients have no node id; 0 only labels errors
    TcpTransport::new()
        .send(0, node, request)
        .await
        .with_context(|| format!("request to {node} failed"))
}

fn print(response: Response) -> Result<()> {
    if let Response::Error { message } = &response {
        bail!("node returned an error: {message}");
    }
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
