use std::sync::Arc;

use parking_sync::{
    session::{SessionStore, StaticSession},
    Config, ConnectionEvent, HttpParkingApi, SyncClient,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    let session: Arc<dyn SessionStore> =
        Arc::new(StaticSession::new(config.auth_token.as_deref()));
    if let Some(user_id) = session.current().and_then(|s| s.user_id().map(String::from)) {
        info!(%user_id, "using session");
    }

    let api = Arc::new(HttpParkingApi::new(&config.api_base_url, session.clone()));
    let gates = config.gates.clone();
    let client = SyncClient::builder(config, api).session(session).spawn();

    let mut events = client.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Exhausted { attempts }) => {
                    error!(attempts, "giving up on the connection");
                }
                Ok(event) => info!(?event, "connection event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "connection events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut audit = client.audit_events();
    tokio::spawn(async move {
        loop {
            match audit.recv().await {
                Ok(event) => info!(
                    admin_id = ?event.admin_id,
                    action = ?event.action,
                    target_id = ?event.target_id,
                    "admin update"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "audit events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for gate in &gates {
        client.subscribe(gate)?;
    }
    client.connect()?;
    info!(gates = gates.len(), "sync client started");

    shutdown_signal().await;
    client.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
