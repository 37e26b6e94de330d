//! ss-local binary
//!
//! Usage: sslocal [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Run with the given configuration file
//!   --check <FILE>       Validate a configuration file and exit
//!   -h, --help           Print help information

use std::env;

use tracing_subscriber::EnvFilter;

use ss_local::server::{LocalConfig, LocalConfigFile, Listener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "--check" => {
            if args.len() < 3 {
                eprintln!("Error: --check requires a config file path");
                return Ok(());
            }
            let config = load_config(&args[2])?;
            println!(
                "Configuration OK: {} server(s), local port {}, strategy {:?}",
                config.servers.len(),
                config.local_port,
                config.strategy
            );
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"ss-local - Shadowsocks local relay

USAGE:
    sslocal [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Run with the given configuration file
    --check <FILE>       Validate a configuration file and exit
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "local_port": 1080,
        "share_over_lan": false,
        "strategy": "fixed",
        "servers": [
            {{
                "server": "ss.example.com",
                "server_port": 8388,
                "method": "chacha20-ietf-poly1305",
                "password": "<secret>",
                "timeout": 5
            }}
        ],
        "proxy": {{ "enabled": false, "type": "socks5", "server": "127.0.0.1", "port": 1081 }}
    }}

    strategy: fixed | balancing | high_availability

ENVIRONMENT:
    RUST_LOG  log filter (default: info)
"#
    );
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    if let Some(server) = config.current_server() {
        tracing::info!("Server {} ({})", server.friendly_name(), server.method);
    }

    let listener = Listener::from_config(&config)?;
    let addr = listener.start().await?;
    tracing::info!("SOCKS5 proxy ready on {}. Press Ctrl+C to stop.", addr);

    tokio::signal::ctrl_c().await?;

    listener.stop();
    tracing::info!("{}", listener.metrics().format_report());
    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<LocalConfig> {
    let content = std::fs::read_to_string(path)?;
    let file = LocalConfigFile::from_json(&content).map_err(|e| anyhow::anyhow!(e))?;
    let config = file.to_config().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}
