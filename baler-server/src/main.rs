use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::ServerConfig::from_env_and_args()?;
    tracing::info!(?config, "starting baler-server");

    let state = routes::AppState {
        config: Arc::new(config),
    };

    let addr = state.config.addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, routes::routes(state)).await?;

    Ok(())
}
