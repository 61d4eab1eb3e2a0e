//! Charity funding reconciler: entry point.
//!
//! Serves the REST operations that reconcile donation claims against the
//! chain and drive the milestone and audit state machines. All chain reads
//! go through an injected [`gateway::ChainGateway`]; production uses the
//! JSON-RPC [`rpc::RpcGateway`].

mod aggregator;
mod api;
mod app;
mod audits;
mod campaigns;
mod config;
mod db;
mod errors;
mod events;
mod gateway;
mod milestones;
mod models;
mod networks;
mod reconciler;
mod rpc;

#[cfg(test)]
mod test_audits;
#[cfg(test)]
mod test_donations;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::AppState;
use config::Config;
use rpc::RpcGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    for network in config.networks.values() {
        info!(
            network = %network.network,
            rpc = %network.rpc_url,
            donation_contract = %network.donation_contract,
            "Network enabled"
        );
    }

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let gateway = Arc::new(RpcGateway::new(&config)?);
    let addr = format!("0.0.0.0:{}", config.api_port);
    let state = AppState::new(pool, config, gateway);

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
