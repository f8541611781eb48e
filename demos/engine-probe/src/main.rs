//! Open one context against a live engine and report on it.
//!
//! Run with: cargo run -p engine-probe -- <endpoint> <document-id>
//!
//! e.g. `cargo run -p engine-probe -- ws://localhost:9076/app/ Sales.qvf`
//!
//! Set `ENGINE_PROBE_TOKEN` to send `Authorization: Bearer <token>`. Timing is
//! configured through the `ENGINE_BROKER_*` variables.

use std::sync::Arc;

use anyhow::{Context as _, bail};
use engine_broker_core::{
    BrokerConfig, ContextConfig, CredentialSupplier, NoCredentials, StaticCredentials,
};
use engine_broker_session::{ContextManager, ContextServices, storage::MemoryStateStore};
use engine_broker_transport::WsConnector;
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CREDENTIAL_TYPE: &str = "bearer";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(endpoint), Some(document_id)) = (args.next(), args.next()) else {
        bail!("usage: engine-probe <endpoint> <document-id>");
    };

    let config = BrokerConfig::from_env().context("reading ENGINE_BROKER_* variables")?;

    let credentials: Arc<dyn CredentialSupplier> = match std::env::var("ENGINE_PROBE_TOKEN") {
        Ok(token) => Arc::new(StaticCredentials::new().with_header(
            CREDENTIAL_TYPE,
            "Authorization",
            format!("Bearer {token}"),
        )),
        Err(_) => Arc::new(NoCredentials),
    };

    let services = ContextServices::new(
        Arc::new(WsConnector::new()),
        credentials,
        Arc::new(MemoryStateStore::new()),
    )
    .with_transport_config(config.transport.clone());
    let manager = Arc::new(ContextManager::new(services, config.manager.clone()));

    // Log every broker event as it happens
    let mut events = manager.events().subscribe_to(&[
        "connected",
        "disconnected",
        "reconnecting",
        "suspended",
        "state-saved",
        "error",
    ]);
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let detail = serde_json::to_string(&event.kind).unwrap_or_default();
            tracing::info!(context_id = %event.context_id, event = event.name(), "{detail}");
        }
    });

    let context = manager
        .create_context(ContextConfig::new(document_id, endpoint, CREDENTIAL_TYPE))
        .await?;
    context.connect().await.context("opening the document")?;

    let version = context.engine_version().await;
    tracing::info!(
        engine_version = version.as_deref().unwrap_or("unknown"),
        generation = context.generation(),
        "Engine reachable"
    );

    let snapshot_id = context.save_state("probe", Some("engine-probe capture")).await?;
    let states = context.list_states().await?;
    println!("{}", serde_json::to_string_pretty(&context.info())?);
    println!("{}", serde_json::to_string_pretty(&states)?);
    tracing::info!(%snapshot_id, "Captured current selections and variables");

    manager.dispose().await;
    event_log.abort();
    Ok(())
}
