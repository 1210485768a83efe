use color_eyre::eyre::{Result, WrapErr};
use fwdproxy::{ProxyConfigBuilder, ProxyServer};
use std::io::IsTerminal;
use std::process;
use tracing_subscriber::EnvFilter;

use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fwdproxy=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port = match args.as_slice() {
        [_, port] => port.parse::<u16>().ok(),
        _ => None,
    };
    let Some(port) = port else {
        let program = args.first().map(String::as_str).unwrap_or("fwdproxy");
        eprintln!("Usage: {program} <listen_port>");
        process::exit(1);
    };

    let config = ProxyConfigBuilder::new()
        .port(port)
        .build()
        .wrap_err("Invalid proxy configuration")?;
    info!(address = %config.bind_addr, "Starting forward proxy");

    let server = ProxyServer::bind(config)
        .await
        .wrap_err_with(|| format!("Failed to listen on port {port}"))?;
    server.run().await.wrap_err("Failed to run forward proxy")?;

    Ok(())
}
