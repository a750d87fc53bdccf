use std::fmt::Debug;
use std::sync::Arc;

use bitcoin::Transaction;
use pcn::actors::RootActor;
use pcn::backup::{BackupActor, BackupActorStartArguments};
use pcn::chain::ChainBackend;
use pcn::node::{NodeActor, NodeActorStartArguments};
use pcn::store::{Store, StoreWithPubSub};
use pcn::tasks::{
    cancel_tasks_and_wait_for_completion, new_tokio_cancellation_token, new_tokio_task_tracker,
};
use pcn::Config;
use ractor::{Actor, OutputPort};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

pub struct ExitMessage(String);

/// Stands in for a real bitcoin node connection. Transactions the node
/// wants on chain are logged as raw hex for the operator's wallet to
/// submit; blocks are fed back through the chain actor by whatever drives
/// this process.
struct LoggingChainBackend;

impl ChainBackend for LoggingChainBackend {
    fn broadcast_transaction(&self, tx: &Transaction) -> anyhow::Result<()> {
        info!(
            txid = %tx.txid(),
            raw = %bitcoin::consensus::encode::serialize_hex(tx),
            "transaction ready for broadcast"
        );
        Ok(())
    }
}

#[tokio::main]
pub async fn main() -> Result<(), ExitMessage> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .map_err(|err| ExitMessage(format!("failed to initialize logger: {}", err)))?;

    let config = Config::parse();

    let node_key = config
        .read_or_generate_node_key()
        .map_err(|err| ExitMessage(format!("failed to read node key: {}", err)))?;
    info!("starting node {}", node_key.pubkey().0);

    let store = Store::new(config.store_path()).map_err(ExitMessage)?;
    let store = StoreWithPubSub::new(store);

    let tracker = new_tokio_task_tracker();
    let token = new_tokio_cancellation_token();
    let root_actor = RootActor::start(tracker, token).await;

    // the peer transport subscribes to these ports; the bare daemon runs
    // without one and serves as the integration point for an embedder
    let outbound = Arc::new(OutputPort::default());
    let events = Arc::new(OutputPort::default());
    let _node_actor = Actor::spawn_linked(
        Some("node".to_string()),
        NodeActor::new(store.clone(), outbound, events),
        NodeActorStartArguments {
            config: config.node.clone(),
            chain_config: config.chain.clone(),
            node_key,
            backend: Arc::new(LoggingChainBackend),
        },
        root_actor.get_cell(),
    )
    .await
    .map_err(|err| ExitMessage(format!("failed to start node actor: {}", err)))?
    .0;

    match config.backup.password.clone() {
        Some(password) => {
            let backup_actor = Actor::spawn_linked(
                Some("backup".to_string()),
                BackupActor::new(store.clone()),
                BackupActorStartArguments {
                    path: config.backup_path(),
                    password,
                },
                root_actor.get_cell(),
            )
            .await
            .map_err(|err| ExitMessage(format!("failed to start backup actor: {}", err)))?
            .0;
            store.subscribe(Box::new(backup_actor));
        }
        None => info!("no backup password configured, channel backups disabled"),
    }

    signal_listener().await;
    cancel_tasks_and_wait_for_completion().await;

    Ok(())
}

impl Debug for ExitMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Exit because {}", self.0)
    }
}

#[cfg(target_family = "unix")]
async fn signal_listener() {
    use tokio::signal::unix::{signal, SignalKind};
    // SIGTERM is commonly sent for graceful shutdown of applications,
    // followed by 30 seconds of grace time, then a SIGKILL.
    let mut sigterm = signal(SignalKind::terminate()).expect("listen for SIGTERM");
    // SIGINT is usually sent due to ctrl-c in the terminal.
    let mut sigint = signal(SignalKind::interrupt()).expect("listen for SIGINT");

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
    };
}

#[cfg(not(target_family = "unix"))]
async fn signal_listener() {
    tokio::signal::ctrl_c()
        .await
        .expect("listen for Ctrl-c signal");
    tracing::info!("Ctrl-c received, shutting down");
}
