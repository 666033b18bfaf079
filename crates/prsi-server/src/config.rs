//! Server configuration: built-in defaults, optional key=value file, CLI
//! overrides applied last.

use std::path::{Path, PathBuf};

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid port ({0})")]
    InvalidPort(u16),
    #[error("invalid max_clients {0}")]
    InvalidMaxClients(usize),
    #[error("invalid max_rooms {0}")]
    InvalidMaxRooms(usize),
}

/// Hard ceilings the original's fixed-size arrays impose; a config or CLI
/// value above these is silently clamped down rather than rejected.
pub const MAX_CLIENTS: usize = 128;
pub const MAX_ROOMS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    pub max_clients: usize,
    pub max_rooms: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ip: "0.0.0.0".to_string(),
            port: 7777,
            max_clients: 128,
            max_rooms: 32,
        }
    }
}

impl ServerConfig {
    fn set_kv(&mut self, key: &str, value: &str) {
        match key {
            "ip" => self.ip = value.to_string(),
            "port" => {
                if let Ok(v) = value.parse() {
                    self.port = v;
                }
            }
            "max_clients" => {
                if let Ok(v) = value.parse() {
                    self.max_clients = v;
                }
            }
            "max_rooms" => {
                if let Ok(v) = value.parse() {
                    self.max_rooms = v;
                }
            }
            _ => {}
        }
    }

    /// Loads key=value pairs from `path`, applying them over the current
    /// values. `#`/`;` start a comment that runs to end of line; blank
    /// lines and lines without `=` are skipped.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        for raw_line in text.lines() {
            let line = raw_line
                .split(['#', ';'])
                .next()
                .unwrap_or("")
                .trim();
            if line.is_empty() {
                continue;
            }
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let k = k.trim();
            let v = v.trim();
            if k.is_empty() || v.is_empty() {
                continue;
            }
            self.set_kv(k, v);
        }

        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(ip) = &cli.ip {
            self.ip = ip.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(n) = cli.max_clients {
            self.max_clients = n;
        }
        if let Some(n) = cli.max_rooms {
            self.max_rooms = n;
        }
    }

    /// Rejects out-of-range values the way `main.c`'s post-parse checks do
    /// (port `[1,65535]`, `max_clients >= 1`, `max_rooms >= 1`), then clamps
    /// anything above the original's fixed-array ceilings down to them.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.port < 1 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if self.max_clients < 1 {
            return Err(ConfigError::InvalidMaxClients(self.max_clients));
        }
        if self.max_rooms < 1 {
            return Err(ConfigError::InvalidMaxRooms(self.max_rooms));
        }

        if self.max_clients > MAX_CLIENTS {
            self.max_clients = MAX_CLIENTS;
        }
        if self.max_rooms > MAX_ROOMS {
            self.max_rooms = MAX_ROOMS;
        }

        Ok(())
    }
}

#[derive(Debug, Parser)]
#[command(name = "prsi-server", version, about = "Prsi card game server")]
pub struct Cli {
    /// Path to a key=value config file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub ip: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long = "max-clients")]
    pub max_clients: Option<usize>,

    #[arg(long = "max-rooms")]
    pub max_rooms: Option<usize>,
}
