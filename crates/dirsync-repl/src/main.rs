#![warn(missing_docs)]

//! dirsync replication daemon.

use anyhow::{Context, Result};
use clap::Parser;
use dirsync_repl::{
    DirectoryClient, LdapDirectory, LdapSettings, ReplConfig, ReplEvent, ReplicationEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "dirsync-repl")]
#[command(about = "Replicate remote LDAP changelogs into a local directory", long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "DIRSYNC_REPL_CONFIG", default_value = "/etc/dirsync/repl.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = ReplConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().context("invalid configuration")?;

    tracing::info!(
        config = %cli.config.display(),
        local = %config.local.url,
        remotes = config.remotes.len(),
        "dirsync replication starting"
    );

    let local = connect(&config.local.url, &config.local.bind_dn, &config.local.bind_password).await;
    let engine = ReplicationEngine::new(config.engine_config()?, local);
    let mut events = engine.subscribe();
    let (handle, task) = engine.spawn();

    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ReplEvent::Destroyed) | Err(RecvError::Closed) => break,
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event logger fell behind");
                }
            }
        }
    });

    for remote in &config.remotes {
        let client = connect(&remote.url, &remote.bind_dn, &remote.bind_password).await;
        let id = handle
            .add_remote(remote.url.clone(), remote.queries.clone(), client)
            .await
            .with_context(|| format!("registering remote {}", remote.url))?;
        tracing::info!(source = %remote.url, id = %id, "Remote registered");
    }
    handle.start().await?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutting down");
    handle.destroy().await?;
    task.await.context("engine task panicked")?;
    let _ = logger.await;
    Ok(())
}

/// Build an LDAP client and try to bind once. A failed bind is not fatal:
/// the engine retries through the same client.
async fn connect(url: &str, bind_dn: &str, bind_password: &str) -> Arc<dyn DirectoryClient> {
    let directory = LdapDirectory::new(LdapSettings::new(url, bind_dn, bind_password));
    if let Err(e) = directory.connect().await {
        tracing::warn!(url = %url, error = %e, "Initial connection failed, will retry");
    }
    Arc::new(directory)
}

fn log_event(event: &ReplEvent) {
    match event {
        ReplEvent::ConnectionEstablished { target } => {
            tracing::info!(peer = %target, "Connection established")
        }
        ReplEvent::CaughtUp {
            source,
            change_number,
        } => tracing::info!(source = %source, change_number, "Caught up"),
        // Logged by the engine itself.
        ReplEvent::StateChanged { .. } | ReplEvent::Conflict { .. } | ReplEvent::DeadLetter { .. } => {}
        ReplEvent::FatalError { source, error } => match source {
            Some(source) => tracing::error!(source = %source, error = %error, "Replication halted"),
            None => tracing::error!(error = %error, "Replication halted"),
        },
        ReplEvent::Destroyed => tracing::info!("Replication engine stopped"),
    }
}
