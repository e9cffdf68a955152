//! molt-server: a hello server that restarts without dropping its sockets.
//!
//! ```text
//! molt-server serve --listen tcp@0.0.0.0:8080 --listen unix@/tmp/molt.sock
//! molt-server reload <pid>     # sends SIGUSR2, a new process takes over
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use molt::hooks::hook;
use molt::{Adapter, Address, Grace, Role};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod adapter;
mod config;
mod telemetry;

use adapter::HttpApp;
use config::ServerFile;

/// molt-server - zero-downtime restart demo
#[derive(Parser)]
#[command(name = "molt-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve on every configured address until told to exit
    Serve {
        /// Address to listen on (e.g. tcp@0.0.0.0:8080, unix@/tmp/a.sock); repeatable
        #[arg(short, long = "listen")]
        listen: Vec<Address>,

        /// TOML file with additional `[[listen]]` entries
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Seconds to wait for exit hooks (overrides MOLT_MAX_WAIT_SECS)
        #[arg(long)]
        max_wait: Option<u64>,
    },
    /// Ask a running server to hand its listeners to a new process
    Reload {
        /// Pid of the running server
        pid: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_local().map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Serve {
            listen,
            config,
            max_wait,
        } => serve(listen, config, max_wait).await,
        Commands::Reload { pid } => reload(pid),
    }
}

async fn serve(
    mut addresses: Vec<Address>,
    config: Option<PathBuf>,
    max_wait: Option<u64>,
) -> Result<()> {
    if let Some(path) = config.or_else(ServerFile::path_from_env) {
        addresses.extend(ServerFile::load(&path)?.listen);
    }
    if addresses.is_empty() {
        addresses.push(Address::default());
    }

    let grace = Arc::new(Grace::from_env());
    if let Some(secs) = max_wait {
        grace.set_max_wait(Duration::from_secs(secs));
    }
    info!(
        pid = std::process::id(),
        role = %grace.role(),
        version = env!("CARGO_PKG_VERSION"),
        "molt-server starting"
    );
    // Before any listener serves, so an early SIGUSR2 is queued, not fatal.
    grace
        .listen_signals()
        .context("Failed to install signal handlers")?;

    let sockets: Vec<PathBuf> = addresses
        .iter()
        .filter_map(|a| a.sock_path().map(PathBuf::from))
        .collect();

    // A fresh master owns its socket paths; leftovers from a crash block bind.
    if grace.role() == Role::SingleMaster {
        for path in &sockets {
            if std::fs::remove_file(path).is_ok() {
                warn!(path = %path.display(), "Removed stale socket file");
            }
        }
    }

    let stop = CancellationToken::new();
    let mut servers = JoinSet::new();
    for (i, address) in addresses.into_iter().enumerate() {
        let mut app = HttpApp::new(format!("app{i}"), address, stop.clone());
        grace
            .register(&mut app)
            .with_context(|| format!("Failed to register {}", app_label(&app)))?;
        let listener = grace
            .get_listener(&app)
            .with_context(|| format!("Failed to acquire listener for {}", app_label(&app)))?;
        servers.spawn(app.run(listener));
    }

    let stop_servers = {
        let stop = stop.clone();
        hook(move || {
            stop.cancel();
            Ok(())
        })
    };
    let remove_sockets = hook(move || {
        remove_socket_files(&sockets);
        Ok(())
    });
    grace.set_exit_hooks_for_single(stop_servers.clone(), Some(remove_sockets));
    grace.set_master_exit_hook(stop_servers.clone());
    grace.set_worker_exit_hook(stop_servers);

    let exit = grace.wait().await?;
    info!(
        signal = %exit.signal,
        handed_off = exit.handed_off,
        outcome = ?exit.outcome,
        "Leaving"
    );

    // Hooks may have timed out before cancelling.
    stop.cancel();
    let drained = tokio::time::timeout(grace.max_wait(), async {
        while let Some(joined) = servers.join_next().await {
            match joined {
                Ok(Err(e)) => warn!(error = %e, "Server stopped with error"),
                Err(e) => warn!(error = %e, "Server task failed"),
                Ok(Ok(())) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Servers still draining at exit");
    }

    Ok(())
}

/// Remove each socket file, logging the ones that cannot be removed.
fn remove_socket_files(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
        }
    }
    removed
}

fn app_label(app: &HttpApp) -> String {
    format!("{} ({})", app.name(), app.address())
}

fn reload(pid: i32) -> Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGUSR2) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to signal process {pid}"));
    }
    info!(pid, "Reload requested");
    Ok(())
}
