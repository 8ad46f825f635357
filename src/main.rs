#![forbid(unsafe_code)]

mod certificates;
mod config;
mod handler;
mod metadata;
mod mime;
mod resource;
mod response;
mod server;
mod util;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {anyhow::Context as _, arc_swap::ArcSwap, tokio::runtime::Runtime};

use crate::{config::Config, resource::ResourceRegistry, server::Server};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        // by default only turn on logging for amethyst
        env_logger::Env::default().default_filter_or("amethyst=info"),
    )
    .init();

    let config_path = args()?;
    let manager = Arc::new(ServerManager::new(
        config_path,
        ResourceRegistry::with_builtins(),
    )?);

    Runtime::new()?.block_on(async {
        #[cfg(unix)]
        spawn_reload_handler(manager.clone());

        let server = Arc::new(Server::new(manager.config.clone()));
        log::info!("Starting server on port {}", server.port());
        server.run().await.context("server terminated")
    })
}

fn args() -> anyhow::Result<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut opts = getopts::Options::new();
    opts.optflag("h", "help", "Print this help text and exit.");
    opts.optflag("V", "version", "Print version information and exit.");

    let matches = opts
        .parse(&args[1..])
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    if matches.opt_present("h") {
        eprintln!("{}", opts.usage(&format!("Usage: {} [options] CONFIG", args[0])));
        std::process::exit(0);
    }

    if matches.opt_present("V") {
        eprintln!("amethyst {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    match matches.free.first() {
        Some(path) => Ok(PathBuf::from(path)),
        None => {
            eprintln!("{}", opts.usage(&format!("Usage: {} [options] CONFIG", args[0])));
            std::process::exit(1);
        }
    }
}

/// Owns the configuration snapshot and rebuilds it on SIGHUP.
struct ServerManager {
    config_path: PathBuf,
    registry: ResourceRegistry,
    config: Arc<ArcSwap<Config>>,
}

impl ServerManager {
    fn new(config_path: PathBuf, registry: ResourceRegistry) -> anyhow::Result<ServerManager> {
        let config = read_config(&config_path, &registry)?;
        Ok(ServerManager {
            config_path,
            registry,
            config: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Swap in a freshly loaded configuration. The new snapshot's TLS caches
    /// start empty, so the next handshake re-derives every certificate.
    /// In-flight requests keep the snapshot they started with.
    fn reconfigure(&self) {
        log::info!("Received HUP; reloading configuration.");

        match read_config(&self.config_path, &self.registry) {
            Ok(mut config) => {
                // The listener is already bound; a changed port only takes
                // effect on restart.
                config.port = self.config.load().port;
                self.config.store(Arc::new(config));
            }
            Err(err) => {
                log::error!("Reload failed, keeping previous configuration; {err:#}");
            }
        }
    }
}

fn read_config(path: &Path, registry: &ResourceRegistry) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration {path:?}"))?;
    let value =
        serde_json::from_str(&raw).with_context(|| format!("parsing configuration {path:?}"))?;
    Config::load(value, registry)
}

#[cfg(unix)]
fn spawn_reload_handler(manager: Arc<ServerManager>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(hup) => hup,
            Err(err) => {
                log::error!("Could not install SIGHUP handler: {err}");
                return;
            }
        };
        while hup.recv().await.is_some() {
            manager.reconfigure();
        }
    });
}
