//! ==============================================================================
//! main.rs - sensor hub entry point
//! ==============================================================================
//!
//! purpose:
//!     back end of the fire-detection dashboard. keeps one consistent,
//!     live copy of every sensor and serves list, group and map views of it.
//!
//! responsibilities:
//!     - load configuration (config/hub.toml + environment)
//!     - start the sync hub: snapshot over rest, deltas over the push channel
//!     - serve the dashboard json api
//!     - shut the hub down cleanly on ctrl-c
//!
//! relationships:
//!     - uses: sensor_hub::config (HubConfig)
//!     - uses: sensor_hub::hub (Hub, HubHandle)
//!     - uses: sensor_hub::server (router)
//!     - talks to: sensor rest backend (GET/POST/PUT/DELETE /sensors)
//!     - talks to: push service (GET /events, GET /events/poll)
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    sensor hub (this binary)                  │
//!     │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//!     │  │ web server  │  │  hub task   │  │ push channel driver │  │
//!     │  │ (port 3000) │  │ (one owner) │  │ (reconnect+backoff) │  │
//!     │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘  │
//!     │         │ commands       │ events             │             │
//!     │         └───────────────>│<───────────────────┘             │
//!     │         <── watch view ──┘                                  │
//!     └──────────────────────────┼──────────────────────────────────┘
//!                                │ http
//!                    ┌───────────┴───────────┐
//!                    ▼                       ▼
//!             ┌─────────────┐         ┌─────────────┐
//!             │ sensor rest │         │ push events │
//!             │     api     │         │   service   │
//!             └─────────────┘         └─────────────┘
//!
//! logging:
//!     RUST_LOG overrides the default `sensor_hub=info`.
//!
//! ==============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use sensor_hub::config::HubConfig;
use sensor_hub::hub::Hub;
use sensor_hub::loader::SensorApi;
use sensor_hub::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sensor_hub=info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sensor hub starting");

    // step 1: load configuration
    let config = HubConfig::load_or_default().context("invalid configuration")?;
    config.log_summary();

    // step 2: the map is optional; a missing key only disables the map views
    let map_style = config.map.style_url();
    if let Err(e) = &map_style {
        tracing::warn!(error = %e, "map views disabled");
    }

    // step 3: start the sync hub
    let api = SensorApi::new(&config.api.base_url, config.api.timeout())
        .context("failed to build sensor api client")?;
    let hub = Hub::from_config(&config, Arc::new(api.clone())).context("failed to build sync hub")?;
    let (handle, hub_task) = hub.spawn();

    // step 4: start the web server in background
    let state = AppState {
        hub: handle.clone(),
        api,
        map_style,
        threshold_km: config.sync.threshold_km,
    };
    let listen_addr = config.server.listen_addr.clone();
    let web = tokio::spawn(async move {
        if let Err(e) = run_server(&listen_addr, state).await {
            tracing::error!(error = %e, "web server error");
        }
    });

    // step 5: run until ctrl-c
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    web.abort();
    if handle.shutdown().await.is_ok() {
        hub_task.await.context("sync hub task failed")?;
    }
    Ok(())
}

// ==============================================================================
// web server
// ==============================================================================

async fn run_server(listen_addr: &str, state: AppState) -> Result<()> {
    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "dashboard api listening");
    axum::serve(listener, app).await?;
    Ok(())
}
