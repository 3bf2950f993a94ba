// LocalDrop for Linux: LAN rendezvous, TCP sessions, receiver daemon and CLI.

mod config;
mod discovery;
mod persist;
mod room;
mod transport;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use localdrop_core::{
    find_peer, Collaborators, Direction, Identity, Node, NodeEvent, NodeHandle, PeerSummary,
    TransferId,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::discovery::MulticastPubSub;
use crate::persist::FsPersistence;
use crate::transport::TcpSessionFactory;

/// How long `send`, `text` and `peers` wait for the room to fill.
const DISCOVERY_WAIT: Duration = Duration::from_secs(12);

#[derive(Parser, Debug)]
#[command(name = "localdrop", version, about = "Share files and text with peers on the same network")]
struct Cli {
    /// Room to join (default: public IP, else "default").
    #[arg(long, global = true)]
    room: Option<String>,
    /// Display name announced to peers.
    #[arg(long, global = true)]
    name: Option<String>,
    /// Config file (default: ~/.config/localdrop/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory for received files.
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay in the room and receive files and texts (default).
    Run,
    /// Send files to a peer (id, id prefix or display name).
    Send {
        peer: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Send a text message.
    Text { peer: String, message: String },
    /// List peers in the room.
    Peers,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if cli.room.is_some() {
        cfg.room = cli.room.clone();
    }
    if cli.name.is_some() {
        cfg.name = cli.name.clone();
    }
    if cli.download_dir.is_some() {
        cfg.download_dir = cli.download_dir.clone();
    }

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(run(cli.command.unwrap_or(Command::Run), cfg))
}

async fn run(command: Command, cfg: Config) -> anyhow::Result<()> {
    let (handle, mut events) = start_node(&cfg).await?;
    let result = execute(command, &handle, &mut events).await;
    handle.shutdown().await?;
    result
}

async fn execute(
    command: Command,
    handle: &NodeHandle,
    events: &mut UnboundedReceiver<NodeEvent>,
) -> anyhow::Result<()> {
    match command {
        Command::Run => receive(events).await,
        Command::Send { peer, paths } => {
            let target = wait_for_peer(handle, events, &peer).await?;
            let ids = if paths.len() == 1 {
                vec![handle.send_file(&target.id, paths[0].clone())?]
            } else {
                handle.send_files(&target.id, paths)?
            };
            finish(events, &ids).await
        }
        Command::Text { peer, message } => {
            let target = wait_for_peer(handle, events, &peer).await?;
            let id = handle.send_text(&target.id, message)?;
            finish(events, &[id]).await
        }
        Command::Peers => {
            tokio::time::sleep(DISCOVERY_WAIT).await;
            for p in handle.peers().await? {
                println!("{}  {}", p.id, p.display_name);
            }
            Ok(())
        }
    }
}

async fn start_node(
    cfg: &Config,
) -> anyhow::Result<(NodeHandle, UnboundedReceiver<NodeEvent>)> {
    let identity = match &cfg.name {
        Some(name) => Identity::with_name(name.clone()),
        None => Identity::generate(),
    };
    let room = room::resolve(cfg.room.as_deref()).await;
    let (pubsub, inbox) = MulticastPubSub::bind(&cfg.multicast_group, cfg.multicast_port)
        .with_context(|| {
            format!(
                "binding multicast {}:{}",
                cfg.multicast_group, cfg.multicast_port
            )
        })?;
    let collaborators = Collaborators {
        pubsub,
        inbox,
        sessions: Arc::new(TcpSessionFactory::new(cfg.connect_timeout())),
        persistence: Arc::new(FsPersistence::new(cfg.download_dir.clone())),
    };
    let name = identity.display_name.clone();
    let (handle, events) = Node::start(identity, &room, cfg.node_config(), collaborators)
        .await
        .context("starting node")?;
    info!(id = %handle.self_id(), name = %name, room = handle.room(), "joined room");
    Ok((handle, events))
}

async fn receive(events: &mut UnboundedReceiver<NodeEvent>) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => report(&event),
                None => bail!("node stopped"),
            },
            res = shutdown_signal() => return res,
        }
    }
}

async fn wait_for_peer(
    handle: &NodeHandle,
    events: &mut UnboundedReceiver<NodeEvent>,
    query: &str,
) -> anyhow::Result<PeerSummary> {
    let deadline = Instant::now() + DISCOVERY_WAIT;
    loop {
        let peers = handle.peers().await?;
        if let Some(p) = find_peer(&peers, query) {
            return Ok(p.clone());
        }
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => report(&event),
            Ok(None) => bail!("node stopped"),
            Err(_) => bail!("no peer matching {query:?} in room {}", handle.room()),
        }
    }
}

/// Wait until every outbound transfer in `ids` finished.
async fn finish(events: &mut UnboundedReceiver<NodeEvent>, ids: &[TransferId]) -> anyhow::Result<()> {
    let mut remaining: HashSet<TransferId> = ids.iter().copied().collect();
    let mut failed = 0;
    while !remaining.is_empty() {
        let Some(event) = events.recv().await else {
            bail!("node stopped");
        };
        report(&event);
        if let NodeEvent::TransferFinished {
            id,
            direction: Direction::Outbound,
            outcome,
            ..
        } = &event
        {
            if remaining.remove(id) && !outcome.is_success() {
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} transfers failed", ids.len());
    }
    Ok(())
}

fn report(event: &NodeEvent) {
    match event {
        NodeEvent::PeersChanged(peers) => debug!(count = peers.len(), "peers changed"),
        NodeEvent::TransferStarted {
            peer,
            name,
            size,
            direction,
            batch_index,
            batch_total,
            ..
        } => match (batch_index, batch_total) {
            (Some(i), Some(n)) => {
                info!(%direction, peer = %peer.short(), name = %name, size, "transfer {i}/{n} started")
            }
            _ => info!(%direction, peer = %peer.short(), name = %name, size, "transfer started"),
        },
        NodeEvent::TransferProgress { id, current, total, .. } => {
            debug!(id, current, total, "progress")
        }
        NodeEvent::TransferFinished {
            peer,
            name,
            direction,
            outcome,
            ..
        } => println!("{direction} {name} ({}): {outcome}", peer.short()),
        NodeEvent::TextReceived { peer, content } => println!("[{}] {content}", peer.short()),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
