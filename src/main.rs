#![warn(clippy::all)]

mod api;
mod cache;
mod config;
mod dataset;
mod logger;
mod lxd;
mod messages;
mod node;
mod pem;
mod resolver;
mod supervisor;
mod utils;

mod prelude {
    pub use anyhow::{Context, Result};
    pub use async_trait::async_trait;
    pub use futures::prelude::*;
    pub use log::{debug, error, info, trace, warn};
    pub use serde::{Deserialize, Serialize};
    pub use thiserror::Error;
}

use clap::{Parser, Subcommand};
use config::{Config, Role};
use prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, PartialEq, Parser)]
#[command(
    name = "lexa",
    version,
    about = "Service and instance discovery for container hosts over DNS and HTTPS"
)]
struct Options {
    /// Configuration file path
    #[arg(long, global = true, default_value = "lexa.hcl")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Subcommand)]
enum Command {
    /// Join the mesh and advertise this host's services to its peers
    Agent,
    /// Answer DNS and HTTPS queries for local containers and mesh agents
    Server,
    /// Answer DNS and HTTPS queries without joining the mesh
    Cluster,
    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let options = Options::parse();

    let role = match options.command {
        Command::Agent => Role::Agent,
        Command::Server => Role::Server,
        Command::Cluster => Role::Cluster,
        Command::Version => {
            println!("Lexa - instance & service discovery for container hosts");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };

    let config = Config::load(&options.config).context("Reading configuration file")?;
    logger::init(&config.log);

    info!(
        "{name} {version} starting as {role}",
        name = env!("CARGO_CRATE_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        role = role.as_str(),
    );

    // Launch Tokio runtime
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Error creating Tokio runtime")?
        .block_on(supervisor::Supervisor::new(role, options.config).run(Arc::new(config)))
        .context("Error in main thread")?;

    // Terminate successfully
    info!("program stopping normally");
    Ok(())
}
