//! ip-bridge: transparent TCP bridge into a sandboxed peer's network.
//!
//! Accepts locally redirected TCP connections, recovers each one's original
//! destination, and splices it onto the matching remote TCP port obtained
//! through the peer's capability RPC session.

mod config;
mod tcp;
mod udp;

use clap::Parser;
use config::BridgeConfig;
use ipbridge_core::RpcSession;
use std::path::PathBuf;
use tcp::TcpBridge;
use tokio::net::{TcpListener, UdpSocket, UnixStream};
use tracing::{error, info, warn};
use udp::UdpStub;

/// ip-bridge: transparent TCP bridge
#[derive(Parser, Debug)]
#[command(name = "ip-bridge", version, about = "Transparent TCP bridge over capability RPC")]
struct Cli {
    /// Address the redirected TCP traffic arrives on
    #[arg(long)]
    tcp_listen: Option<String>,

    /// Address for the UDP stub (empty disables it)
    #[arg(long)]
    udp_listen: Option<String>,

    /// Unix socket of the capability RPC peer
    #[arg(long)]
    session_socket: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ip-bridge/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ip-bridge");

    let config_path = PathBuf::from(&cli.config);
    let config = match BridgeConfig::load(
        Some(&config_path),
        cli.tcp_listen.as_deref(),
        cli.udp_listen.as_deref(),
        cli.session_socket.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let stream = match UnixStream::connect(&config.session_socket).await {
        Ok(s) => s,
        Err(e) => {
            error!(
                path = %config.session_socket.display(),
                error = %e,
                "failed to connect to session socket"
            );
            std::process::exit(1);
        }
    };
    let (session, session_io) = RpcSession::start(stream);
    info!(path = %config.session_socket.display(), "rpc session established");

    let listener = match TcpListener::bind(config.tcp_listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.tcp_listen, error = %e, "failed to bind tcp listener");
            std::process::exit(1);
        }
    };

    if let Some(addr) = config.udp_listen {
        match UdpSocket::bind(addr).await {
            Ok(socket) => {
                tokio::spawn(async move {
                    if let Err(e) = UdpStub::new(socket).run().await {
                        warn!(error = %e, "udp stub stopped");
                    }
                });
            }
            Err(e) => warn!(addr = %addr, error = %e, "failed to bind udp stub, continuing without it"),
        }
    }

    let bridge = TcpBridge::new(session.network());

    tokio::select! {
        result = bridge.run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "tcp listener failed");
                std::process::exit(1);
            }
        }
        result = session_io => {
            match result {
                Ok(Ok(())) => error!("rpc session closed by peer"),
                Ok(Err(e)) => error!(error = %e, "rpc session failed"),
                Err(e) => error!(error = %e, "rpc session task panicked"),
            }
            std::process::exit(1);
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("ip-bridge stopped");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
