//! Subsystem lifecycle.
//!
//! The supervisor starts every subsystem the role calls for on its own task,
//! watches the configuration file, and blocks on signals. A config change or
//! SIGHUP/SIGUSR1 tears all subsystems down and rebuilds them against the
//! fresh snapshot; reload is deliberately coarse, nothing attempts a partial
//! reconfiguration. SIGTERM/SIGINT shut down cleanly.

use crate::cache::Cache;
use crate::config::{Config, ConfigError, Role};
use crate::pem::PemError;
use crate::prelude::*;
use crate::{api, logger, node, resolver};
use notify::Watcher;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cap on how long one subsystem may take to stop.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SubsystemError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unable to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pem(#[from] PemError),

    #[error("overlay failure: {0}")]
    Overlay(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A started subsystem: its cancellation token and the task driving it.
struct Running {
    name: &'static str,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), SubsystemError>>,
}

pub struct Supervisor {
    role: Role,
    config_path: PathBuf,
    cache: Arc<Cache>,
}

impl Supervisor {
    pub fn new(role: Role, config_path: PathBuf) -> Self {
        Self {
            role,
            config_path,
            cache: Arc::new(Cache::new()),
        }
    }

    pub async fn run(self, config: Arc<Config>) -> Result<()> {
        let mut config = config;
        let mut subsystems = self
            .start_subsystems(&config)
            .await
            .context("Starting subsystems")?;

        // Watch the config file; events funnel into a depth-1 channel so a
        // burst of writes collapses into one reload.
        let (watch_tx, mut watch_rx) = mpsc::channel::<()>(1);
        let mut watcher =
            notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
                if let Ok(event) = event {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        let _ = watch_tx.try_send(());
                    }
                }
            })
            .context("Creating configuration watcher")?;
        if let Err(err) = watcher.watch(&self.config_path, notify::RecursiveMode::NonRecursive) {
            warn!(
                "Unable to watch configuration file {}: {}",
                self.config_path.display(),
                err
            );
        }

        let mut sigterm = signal(SignalKind::terminate()).context("Installing signal handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Installing signal handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("Installing signal handler")?;
        let mut sigusr1 =
            signal(SignalKind::user_defined1()).context("Installing signal handler")?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading");
                    (config, subsystems) = self.reload(config, subsystems).await?;
                }
                _ = sigusr1.recv() => {
                    info!("SIGUSR1 received, reloading");
                    (config, subsystems) = self.reload(config, subsystems).await?;
                }
                Some(()) = watch_rx.recv() => {
                    info!("Reloading with updated configuration");
                    (config, subsystems) = self.reload(config, subsystems).await?;
                }
            }
        }

        self.stop_subsystems(subsystems).await;
        Ok(())
    }

    /// Coarse restart: reread the config, stop everything, start everything
    /// against the fresh snapshot. A config file that fails to parse keeps
    /// the previous snapshot.
    async fn reload(
        &self,
        previous: Arc<Config>,
        running: Vec<Running>,
    ) -> Result<(Arc<Config>, Vec<Running>)> {
        let config = match Config::load(&self.config_path) {
            Ok(config) => Arc::new(config),
            Err(err) => {
                error!("Unable to read HCL configuration file: {}", err);
                previous
            }
        };
        logger::init(&config.log);

        self.stop_subsystems(running).await;

        let subsystems = self
            .start_subsystems(&config)
            .await
            .context("Restarting subsystems")?;
        Ok((config, subsystems))
    }

    async fn start_subsystems(&self, config: &Arc<Config>) -> Result<Vec<Running>, SubsystemError> {
        let mut running = Vec::new();

        if self.role != Role::Agent {
            let dns = resolver::DnsServer::new(Arc::clone(config), Arc::clone(&self.cache)).await?;
            running.push(launch("dns", |token| dns.run(token)));

            let dot = resolver::DotServer::new(Arc::clone(config), Arc::clone(&self.cache)).await?;
            running.push(launch("dns.tls", |token| dot.run(token)));

            let http = api::HttpServer::new(Arc::clone(config), Arc::clone(&self.cache)).await?;
            running.push(launch("tls", |token| http.run(token)));
        }

        if self.role != Role::Cluster {
            let p2p = node::Node::new(Arc::clone(config), Arc::clone(&self.cache), self.role)?;
            running.push(launch("p2p", |token| p2p.run(token)));
        }

        Ok(running)
    }

    async fn stop_subsystems(&self, running: Vec<Running>) {
        for mut subsystem in running {
            subsystem.shutdown.cancel();
            match tokio::time::timeout(SHUTDOWN_DEADLINE, &mut subsystem.task).await {
                Ok(Ok(Ok(()))) => trace!("{} subsystem stopped", subsystem.name),
                Ok(Ok(Err(err))) => {
                    warn!("{} subsystem shutdown error: {}", subsystem.name, err);
                }
                Ok(Err(err)) => warn!("{} subsystem task failed: {}", subsystem.name, err),
                Err(_) => {
                    warn!(
                        "{} subsystem did not stop within {:?}, aborting",
                        subsystem.name, SHUTDOWN_DEADLINE
                    );
                    subsystem.task.abort();
                }
            }
        }
    }
}

fn launch<F, Fut>(name: &'static str, run: F) -> Running
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), SubsystemError>> + Send + 'static,
{
    let shutdown = CancellationToken::new();
    Running {
        name,
        shutdown: shutdown.clone(),
        task: tokio::spawn(run(shutdown)),
    }
}
