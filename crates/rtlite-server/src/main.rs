//! rtlite - a lightweight clustered realtime messaging server.

use std::sync::Arc;

use log::{error, info};

use rtlite_server::config::Config;
use rtlite_server::server::Server;

const DEFAULT_CONFIG_PATH: &str = "rtlite.toml";

const USAGE: &str = "\
rtlite - realtime messaging server

Usage: rtlite [OPTIONS]

Options:
  -c, --config <FILE>     Config file path (default: rtlite.toml)
      --config=<FILE>     Same, in one argument
  -h, --help              Show this help message

Configuration:
  The config file uses TOML format. Every setting can be overridden with
  environment variables using the RTLITE__ prefix:

  RTLITE__SERVER__BIND=0.0.0.0:6022
  RTLITE__SERVER__WORKERS=4
  RTLITE__CLUSTER__SERVER_NAME=node-2
  RTLITE__LOG__LEVEL=debug";

fn usage_error(reason: &str) -> ! {
    eprintln!("rtlite: {}", reason);
    eprintln!("run 'rtlite --help' for usage");
    std::process::exit(2);
}

/// Parse the command line. Only the config path is settable here; all
/// runtime tuning lives in the config file and environment.
fn parse_config_path() -> String {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            config_path = Some(path.to_string());
            continue;
        }
        match arg.as_str() {
            "-c" | "--config" => match args.next() {
                Some(path) => config_path = Some(path),
                None => usage_error("missing file path after -c/--config"),
            },
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => usage_error(&format!("unknown argument '{}'", other)),
        }
    }

    config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

fn main() {
    let config_path = parse_config_path();

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log.level.as_filter()),
    )
    .init();

    info!("Loaded configuration from {}", config_path);

    // Worker count 0 means one per core.
    let num_workers = if config.server.workers == 0 {
        num_cpus::get()
    } else {
        config.server.workers
    };

    info!(
        "Starting rtlite as {} with {} worker threads (max_message_size={}KB)",
        config.cluster.server_name,
        num_workers,
        config.limits.max_message_size / 1024
    );

    let config = Arc::new(config);

    let mut server = match Server::new(config.server.bind, num_workers, config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
