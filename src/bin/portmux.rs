//! portmux gateway binary
//!
//! Usage: portmux [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration file
//!   -h, --help           Print help information

use std::env;

use portmux::server::{GatewayConfig, GatewayConfigFile, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        None => {
            run_gateway(GatewayConfig::from_env()).await?;
        }
        Some("-h") | Some("--help") => {
            print_usage();
        }
        Some("-g") | Some("--generate") => {
            generate_config()?;
        }
        Some("-c") | Some("--config") => {
            let Some(path) = args.get(2) else {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            };
            run_gateway(load_config(path)?).await?;
        }
        Some(other) => {
            eprintln!("Unknown option: {}", other);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"portmux - HTTP liveness + SOCKS5 gateway on a single port

USAGE:
    portmux [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Print a default configuration file
    -h, --help              Print help information

ENVIRONMENT:
    PORT                    Listen port (default 8080), overrides the file
    LISTEN_ADDR             Listen address (default 0.0.0.0)
    RUST_LOG                Log filter (default info)

EXAMPLES:
    Run with defaults:
        PORT=10000 portmux

    Generate and use a configuration file:
        portmux --generate > portmux.toml
        portmux --config portmux.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config_file = GatewayConfigFile::default();

    println!("# portmux configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", config_file.to_toml()?);

    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<GatewayConfig> {
    let content = std::fs::read_to_string(path)?;
    let mut config = GatewayConfigFile::from_toml(&content)?.to_config()?;
    config.apply_env();
    Ok(config)
}

async fn run_gateway(config: GatewayConfig) -> anyhow::Result<()> {
    tracing::info!("Starting portmux {} on {}", portmux::VERSION, config.bind_addr());
    tracing::info!(
        "Timeouts: sniff {:?}, handshake {:?}, connect {:?}, idle {:?}",
        config.sniff_timeout,
        config.handshake_timeout,
        config.connect_timeout,
        config.idle_timeout
    );

    let server = Server::bind(config).await?;
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
