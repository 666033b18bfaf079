mod actor;
mod codec;
mod config;
mod conn;
mod dispatch;
mod room;
mod session;

use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actor::Command;
use config::{Cli, ServerConfig};
use dispatch::Server;

const TICK_INTERVAL: Duration = Duration::from_millis(250);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Loads the config file if one was given, then layers CLI overrides on top.
/// A missing or unreadable config file is a warning, not a fatal error — the
/// original's `config_load_file` returning 0 just falls back to defaults.
fn load_config(cli: &Cli) -> ServerConfig {
    let mut cfg = ServerConfig::default();
    if let Some(path) = &cli.config {
        if let Err(e) = cfg.load_file(path) {
            warn!(error = %e, "cannot load config file, using defaults");
        }
    }
    cfg.apply_cli(cli);
    cfg
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let mut cfg = load_config(&cli);
    if let Err(e) = cfg.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(2);
    }
    info!(ip = %cfg.ip, port = cfg.port, max_clients = cfg.max_clients, max_rooms = cfg.max_rooms, "starting prsi-server");

    let listener = match TcpListener::bind((cfg.ip.as_str(), cfg.port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    let server = Server::new(cfg.max_clients, cfg.max_rooms);
    let (actor_tx, actor_rx) = mpsc::unbounded_channel::<Command>();
    let actor_handle = tokio::spawn(actor::run(server, actor_rx));

    let ticker_tx = actor_tx.clone();
    let ticker_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            if ticker_tx.send(Command::Tick).is_err() {
                break;
            }
        }
    });

    let accept_tx = actor_tx.clone();
    let accept_handle = tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let _ = socket.set_nodelay(true);

            let (reply_tx, reply_rx) = oneshot::channel();
            if accept_tx.send(Command::Accept { reply: reply_tx }).is_err() {
                break;
            }
            let Ok(Some((ci, outbound_rx))) = reply_rx.await else {
                warn!(%peer, "client limit reached, dropping connection");
                continue;
            };

            tokio::spawn(conn::run(ci, socket, peer, accept_tx.clone(), outbound_rx));
        }
    });

    let stdin_tx = actor_tx.clone();
    let stdin_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "quit" | "exit" | "q" => {
                    let _ = stdin_tx.send(Command::Shutdown);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, shutting down");
        }
        _ = stdin_handle => {}
    }

    let _ = actor_tx.send(Command::Shutdown);
    ticker_handle.abort();
    accept_handle.abort();
    let _ = actor_handle.await;

    info!("prsi-server stopped");
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending().await
}
