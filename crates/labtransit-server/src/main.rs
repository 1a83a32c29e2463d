//! LabTransit — specimen transport between incubator and microscopes.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod routes;
mod state;
mod validate;

use state::AppState;

fn resolve_config_dir() -> PathBuf {
    std::env::var("LABTRANSIT_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "validate-config" | "--validate-config" => {
                let config_dir = if args.len() > 2 {
                    PathBuf::from(&args[2])
                } else {
                    resolve_config_dir()
                };
                let report = validate::validate(&config_dir);
                validate::print_report(&report);
                std::process::exit(if report.valid { 0 } else { 1 });
            }
            "--help" | "-h" | "help" => {
                println!("LabTransit — incubator to microscope specimen transport");
                println!();
                println!("Usage: labtransit [command]");
                println!();
                println!("Commands:");
                println!("  (none)                      Start the server on the bench rig");
                println!("  validate-config [dir]       Check transport.json in a config directory");
                println!("  help                        Show this help message");
                println!();
                println!("Environment:");
                println!("  PORT                        HTTP port (default 3010)");
                println!("  LABTRANSIT_CONFIG_DIR       Config directory (default ./config)");
                println!("  LABTRANSIT_DEVICE_TIMEOUT_SECS, LABTRANSIT_ARM_TIMEOUT_SECS");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'labtransit help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let config_dir = resolve_config_dir();
    info!("Config directory: {}", config_dir.display());

    let config = labtransit_core::LabTransitConfig::from_env(&config_dir)?;
    let port = config.port;

    let state = Arc::new(AppState::new(config));

    // The registry starts empty; seed it from the incubator.
    match state.orchestrator.refresh_slots().await {
        Ok(count) => info!("Registry seeded with {} slots", count),
        Err(e) => warn!("Initial slot refresh failed: {}", e),
    }

    let app = routes::build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("LabTransit server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
