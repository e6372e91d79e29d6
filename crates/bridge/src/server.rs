//! TCP listener for the bridge.

use std::{net::SocketAddr, sync::Arc};

use {
    tokio::net::TcpListener,
    tracing::{info, warn},
};

use crate::{connection::handle_connection, state::BridgeState};

/// Bind the listener and serve forever.
pub async fn serve(bind: &str, port: u16, state: Arc<BridgeState>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    banner(&listener)?;
    run(listener, state).await;
    Ok(())
}

fn banner(listener: &TcpListener) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into());

    let lines = [
        format!("tether bridge v{}", env!("CARGO_PKG_VERSION")),
        format!(
            "protocol v{}, listening on {local}",
            tether_protocol::PROTOCOL_VERSION
        ),
        format!("host {host}"),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));
    Ok(())
}

/// Accept loop (shared between production startup and tests). Accept
/// failures are logged and never bring the bridge down.
pub async fn run(listener: TcpListener, state: Arc<BridgeState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    handle_connection(stream, peer, state).await;
                });
            },
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}
