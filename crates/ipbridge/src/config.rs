//! Bridge configuration: TOML file + CLI overrides.

use ipbridge_core::{BridgeError, BridgeResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// `[bridge]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_tcp_listen")]
    pub tcp_listen: String,
    /// Empty disables the datagram stub.
    #[serde(default = "default_udp_listen")]
    pub udp_listen: String,
    #[serde(default = "default_session_socket")]
    pub session_socket: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            tcp_listen: default_tcp_listen(),
            udp_listen: default_udp_listen(),
            session_socket: default_session_socket(),
        }
    }
}

fn default_tcp_listen() -> String {
    "127.0.0.1:15001".to_string()
}
fn default_udp_listen() -> String {
    "127.0.0.1:15002".to_string()
}
fn default_session_socket() -> String {
    "/tmp/sandstorm-api".to_string()
}

/// Resolved bridge configuration (addresses parsed, CLI overrides applied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub tcp_listen: SocketAddr,
    pub udp_listen: Option<SocketAddr>,
    pub session_socket: PathBuf,
}

impl BridgeConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_tcp_listen: Option<&str>,
        cli_udp_listen: Option<&str>,
        cli_session_socket: Option<&str>,
    ) -> BridgeResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| BridgeError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let tcp_str = cli_tcp_listen.unwrap_or(&file_config.bridge.tcp_listen);
        let udp_str = cli_udp_listen.unwrap_or(&file_config.bridge.udp_listen);
        let socket_str = cli_session_socket.unwrap_or(&file_config.bridge.session_socket);

        let udp_listen = if udp_str.trim().is_empty() {
            None
        } else {
            Some(parse_addr("udp_listen", udp_str)?)
        };

        Ok(Self {
            tcp_listen: parse_addr("tcp_listen", tcp_str)?,
            udp_listen,
            session_socket: expand_tilde_str(socket_str),
        })
    }
}

fn parse_addr(key: &str, value: &str) -> BridgeResult<SocketAddr> {
    value
        .trim()
        .parse()
        .map_err(|e| BridgeError::Config(format!("invalid {key} address {value:?}: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
