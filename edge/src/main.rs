use anyhow::Result;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use uniroute_edge::{ingress_stream, server, EdgeConfig, EdgeState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "uniroute_edge=info".into()),
        )
        .init();

    let config = EdgeConfig::from_env()?;
    let public_port = config.public_port;
    let base_domain = config.base_domain.clone();

    let store = uniroute_edge::store::Store::connect(&config.database_url).await?;
    let state = EdgeState::build(config, store).await?;

    ingress_stream::spawn_stream_listeners(state.clone()).await?;
    let app = server::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], public_port));
    info!("uniroute edge on {addr} (base domain: {base_domain})");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
