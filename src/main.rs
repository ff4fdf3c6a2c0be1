use std::env;
use std::error::Error;
use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use tokio::signal::unix::SignalKind;

use busbridge::cli;
use busbridge::config::ProxyConfig;
use busbridge::proxy::Proxy;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = match cli::Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            process::exit(code);
        }
    };

    let log_level = match env::var("LOG_LEVEL") {
        Ok(value) => value,
        Err(_) => {
            if args.verbose {
                "debug".to_string()
            } else if args.info {
                "info".to_string()
            } else {
                "warn".to_string()
            }
        }
    };
    env::set_var("RUST_LOG", log_level);
    env_logger::init();
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let config = match ProxyConfig::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("busbridge: {err}");
            process::exit(1);
        }
    };

    log::info!(
        "Starting busbridge v{VERSION}: {} ({:?}) -> {} ({:?})",
        config.source_bus_name,
        config.source_bus_type,
        config.proxy_bus_name,
        config.target_bus_type
    );

    let proxy = match Proxy::connect(config).await {
        Ok(proxy) => proxy,
        Err(err) => {
            log::error!("Failed to set up proxy: {err}");
            process::exit(1);
        }
    };

    // Setup signal handlers
    let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate())?;

    let mut exit_code = 0;
    tokio::select! {
        // Serve both buses until the source goes away or something breaks
        result = proxy.run() => {
            match result {
                Ok(()) => {
                    log::info!("Source service vanished. Shutting down.");
                }
                Err(err) => {
                    log::error!("Error running proxy: {err}");
                    exit_code = 1;
                }
            }
        },
        // Setup CTRL+C handler
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received CTRL+C. Shutting down.");
        },
        // Setup SIGTERM handler
        _ = sig_term.recv() => {
            log::info!("Received SIGTERM. Shutting down.");
        }
    }

    proxy.shutdown().await;

    log::info!("Busbridge stopped");
    process::exit(exit_code);
}
