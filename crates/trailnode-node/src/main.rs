use tokio::sync::mpsc;
use tracing::{error, info, warn};
use trailnode_commands::{
    CommandExecutor, CommandFault, CommandResolver, CommandStore, CommandsCleanerCommand,
};
use trailnode_core::{NodeConfig, NodeError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trailnode_node=info,trailnode_commands=info".into()),
        )
        .init();

    // load config: TRAILNODE_CONFIG env > ~/.trailnode/trailnode.toml
    let config_path = std::env::var("TRAILNODE_CONFIG").ok();
    let config = NodeConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        NodeConfig::default()
    });

    let db = open_database(&config.database.path)?;
    let store = CommandStore::new(db)?;
    info!("command schema ready");

    let resolver = CommandResolver::new();
    resolver.register(CommandsCleanerCommand::new(store.clone(), &config.commands));

    // Fault channel: executor → this loop. Fatal faults end the process;
    // unfinished commands are replayed on the next boot.
    let (fault_tx, mut fault_rx) = mpsc::channel::<CommandFault>(64);

    let executor = CommandExecutor::builder(store, resolver)
        .config(config.commands.clone())
        .faults(fault_tx)
        .build();

    executor.init().await?;
    let resumed = executor.replay().await?;
    executor.start();
    info!(resumed, "trailnode node running");

    let exit_code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break 0;
            }
            fault = fault_rx.recv() => match fault {
                Some(fault) if fault.is_fatal() => {
                    error!("fatal command fault: {fault}");
                    break 1;
                }
                Some(fault) => warn!("command fault: {fault}"),
                None => break 0,
            },
        }
    };

    executor.shutdown().await;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Open the node database, creating its directory if needed.
fn open_database(path: &str) -> trailnode_core::Result<rusqlite::Connection> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent).map_err(NodeError::Io)?;
    }
    info!(path = %path, "opening SQLite database");
    let db = rusqlite::Connection::open(path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;")?;
    Ok(db)
}
