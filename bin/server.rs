// Meter Readings - Web Server
// Upload endpoint + static upload form with Axum

use anyhow::{Context, Result};
use clap::Parser;
use meter_readings::api::{router, AppState};
use meter_readings::logging::init_logging;
use meter_readings::ServerConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    init_logging(&config.app.log_level)?;

    // Storage lives for the whole process and is handed to the router
    let conn = config.app.open_seeded_database()?;
    let state = AppState::new(conn);

    let app = router(state, &config.web_dir);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;

    info!(addr = %config.bind, "Meter reading server listening");
    println!("\n🚀 Server running on http://{}", config.bind);
    println!("   Upload: POST /meter-reading-uploads");
    println!("   UI:     /");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
