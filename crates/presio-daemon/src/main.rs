//! # Presio Daemon
//!
//! Publishes a live rich-presence status to the local presence service.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! presio
//!
//! # Run with a config file at ./presio.toml
//! PRESIO_CLIENT_ID=1234567890 presio
//! ```

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use presio_core::{Asset, PresenceClient, Value};
use presio_transport::{IpcTransport, TransportEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "presio=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;
    if config.client_id.is_empty() {
        warn!("No client id configured; the handshake will be rejected");
    }

    info!(client_id = %config.client_id, "Starting Presio");

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(IpcTransport::new(config.client_id.clone(), events_tx));
    let client = PresenceClient::new(config.client_config(), transport);

    // Seed the asset index from configuration.
    for (name, id) in &config.icons.canonical {
        client.assets().insert(Asset::canonical(name.as_str(), id.as_str()));
    }
    client.assets().sync_custom(&config.icons.custom);

    // Session placeholders.
    client.sync_argument("general.client_id", Value::from(config.client_id.clone()));
    client.sync_timestamp("data.general.time");
    client.sync_dynamic_variables(config.variables.clone());

    // The default icon, resolved (and memoized) through the engine's
    // fallback chain, exposed to expressions as a placeholder.
    let resolver = Arc::clone(client.icon_resolver());
    let default_icon = config.icons.default.clone();
    client.sync_producer(
        "general.icon",
        Arc::new(move || Value::from(resolver.resolve(false, false, &[default_icon.as_str()]))),
    );

    // Templates.
    client.set_default_template(config.presence.default.clone());
    for (id, template) in &config.presence.overrides {
        client.set_forced_template(id.clone(), template.clone());
    }

    for (path, value) in client.scripts().placeholder_preview(&["all"]) {
        debug!(placeholder = %path, %value, "Placeholder installed");
    }

    client.on_join_request(|user| {
        info!(user = %user.username, "Join request received; respond via control interface");
    });

    client.init();

    let mut tick = tokio::time::interval(Duration::from_millis(config.connection.tick_interval_ms));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                client.shutdown(false).await;
                break;
            }
            Some(event) = events_rx.recv() => {
                // A fresh handshake starts a new session clock.
                if matches!(event, TransportEvent::Ready { .. }) {
                    client.sync_timestamp("data.general.time");
                }
                client.handle_event(event).await;
            }
            _ = tick.tick() => {
                client.tick().await;
                client.update().await;
            }
        }
    }

    Ok(())
}
