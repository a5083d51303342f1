//! storage-supervisor daemon entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use storage_supervisor::api;
use storage_supervisor::config::Config;
use storage_supervisor::service::RemoteStorage;

/// Print usage information
fn print_usage() {
    eprintln!("Usage: storage-supervisor <config.yaml>");
    eprintln!();
    eprintln!("storage-supervisor - Keeps a remote-storage mount engine running and its remotes mounted");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  storage-supervisor /etc/storage-supervisor/config.yaml");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("storage-supervisor starting");
    info!("Loaded configuration from {:?}", config_path);

    let storage = RemoteStorage::new(&config)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    // Keep serving even if the subsystem could not come up
    if let Err(e) = storage.init().await {
        error!("Failed to initialize remote storage: {}", e);
    }

    if let Some(listen) = config.api.listen {
        let s = Arc::clone(&storage);
        tokio::spawn(async move {
            if let Err(e) = api::serve(listen, s).await {
                error!("Admin API stopped: {}", e);
            }
        });
    }

    info!("Press Ctrl+C to stop");

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    info!("Shutting down");
    storage.shutdown().await;
    info!("Engine stopped, exiting");

    Ok(())
}
