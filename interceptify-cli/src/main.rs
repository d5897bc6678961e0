//! Command-line front end: configuration, logging, CA bootstrap, run loop.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use interceptify::Proxy;
use interceptify::certificate_authority::RootAuthority;
use interceptify::plugin::Logger;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "interceptify",
    about = "Intercepting HTTP/S proxy for security testing and traffic analysis",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy engine
    Start {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1")]
        address: IpAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("interceptify=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Start { port, address } => start(address, port).await,
    }
}

async fn start(address: IpAddr, port: u16) -> anyhow::Result<()> {
    let ca_dir = ca_dir()?;
    let ca = RootAuthority::open(ca_dir.join("ca.crt"), ca_dir.join("ca.key"))
        .context("failed to initialize the certificate authority")?;
    info!(
        cert = %ca_dir.join("ca.crt").display(),
        "root CA ready; install the certificate in your client's trust store to intercept TLS"
    );

    let proxy = Proxy::builder(ca)
        .with_addr(SocketAddr::new(address, port))
        .with_plugin(Logger::new())
        .build()
        .context("failed to assemble the proxy")?;

    proxy
        .start(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("proxy terminated")
}

/// CA material lives under `$HOME/.interceptify`; `$HOME` is read once at
/// startup.
fn ca_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set; cannot locate the CA directory")?;
    Ok(PathBuf::from(home).join(".interceptify"))
}
