use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    tether_bridge::{BridgeServices, BridgeState, server},
    tether_pairing::{
        AllowlistApprover, AutoApprover, DenyAllApprover, PairedNodeStore, PairingApprover,
    },
};

#[derive(Parser)]
#[command(name = "tether", about = "Tether — paired-node bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge server.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = tether_protocol::DEFAULT_PORT)]
        port: u16,
        /// Paired-node store file (defaults to the platform data dir).
        #[arg(long)]
        store: Option<PathBuf>,
        /// Pairing approval policy: auto, deny, or allowlist:<path>.
        #[arg(long, default_value = "deny")]
        approval: String,
    },
    /// List paired nodes.
    Nodes {
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn approval_policy(spec: &str) -> anyhow::Result<Arc<dyn PairingApprover>> {
    match spec {
        "auto" => Ok(Arc::new(AutoApprover)),
        "deny" => Ok(Arc::new(DenyAllApprover)),
        other => match other.strip_prefix("allowlist:") {
            Some(path) if !path.is_empty() => Ok(Arc::new(AllowlistApprover::new(path))),
            _ => anyhow::bail!(
                "unknown approval policy '{other}' (expected auto, deny, or allowlist:<path>)"
            ),
        },
    }
}

async fn open_store(path: Option<PathBuf>) -> anyhow::Result<Arc<PairedNodeStore>> {
    let path = path
        .or_else(PairedNodeStore::default_path)
        .ok_or_else(|| anyhow::anyhow!("no store path available; pass --store"))?;
    let store = Arc::new(PairedNodeStore::new(path));
    let loaded = store.load().await?;
    info!(nodes = loaded, path = %store.path().display(), "paired-node store loaded");
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command {
        Commands::Serve {
            bind,
            port,
            store,
            approval,
        } => {
            let approver = approval_policy(&approval)?;
            let store = open_store(store).await?;

            let mut services = BridgeServices::noop();
            services.approver = approver;

            let state = BridgeState::new(Some(store), services);
            server::serve(&bind, port, state).await
        },
        Commands::Nodes { store } => {
            let store = open_store(store).await?;
            for node in store.all().await {
                println!(
                    "{}\t{}\t{}\tlast seen {}",
                    node.node_id,
                    node.display_name.as_deref().unwrap_or("-"),
                    node.platform.as_deref().unwrap_or("-"),
                    node.last_seen_at_ms,
                );
            }
            Ok(())
        },
    }
}
