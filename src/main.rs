use dotenvy::dotenv;
use tracing::info;

use subflow::infra::{
    app::create_app, error::InfraError, setup::init_app_state, sweep_worker::run_sweep_loop,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let app_state = init_app_state().await?;

    let bind_addr = app_state.config.bind_addr;

    let app = create_app(app_state.clone());

    // Spawn the sweep task (after tracing is initialized)
    let sweep_use_cases = app_state.sweep_use_cases.clone();
    let interval_secs = app_state.config.sweep_interval_secs;
    let scan_timeout_secs = app_state.config.sweep_scan_timeout_secs;
    tokio::spawn(async move {
        run_sweep_loop(sweep_use_cases, interval_secs, scan_timeout_secs).await;
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(InfraError::TcpBind)?;

    info!("Backend listening at {}", &listener.local_addr()?);

    axum::serve(listener, app).await.map_err(InfraError::Server)?;

    Ok(())
}
