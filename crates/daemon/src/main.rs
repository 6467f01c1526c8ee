//! OpenKanban daemon binary.
//!
//! `openkanban daemon run` is the foreground daemon; the remaining
//! subcommands install and drive it under the platform service manager.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use daemon::board::BoardStore;
use daemon::broker::Broker;
use daemon::ipc::{self, pidfile, DaemonClient, DaemonSocket, SocketError};
use daemon::{agent_status, paths, service, web};

/// OpenKanban - AI coding agents on a kanban board.
#[derive(Parser, Debug)]
#[command(name = "openkanban")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the OpenKanban daemon
    #[command(subcommand)]
    Daemon(DaemonCommand),
}

#[derive(Subcommand, Debug, Clone)]
enum DaemonCommand {
    /// Run the daemon in the foreground
    Run,
    /// Install the daemon as a user service
    Install,
    /// Remove the daemon service
    Uninstall,
    /// Start the daemon service
    Start,
    /// Stop the daemon service
    Stop,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(DaemonCommand::Run) => run_daemon().await,
        Commands::Daemon(DaemonCommand::Install) => install(),
        Commands::Daemon(DaemonCommand::Uninstall) => uninstall(),
        Commands::Daemon(DaemonCommand::Start) => start(),
        Commands::Daemon(DaemonCommand::Stop) => stop(),
        Commands::Daemon(DaemonCommand::Status) => status().await,
    }
}

/// Foreground daemon.
///
/// Exit code 0 on clean shutdown; 1 when another daemon owns the socket.
async fn run_daemon() -> anyhow::Result<()> {
    paths::ensure_state_dir().context("creating state directory")?;
    init_tracing()?;

    let socket = match DaemonSocket::bind(&paths::socket_path()).await {
        Ok(socket) => socket,
        Err(SocketError::InUse(path)) => {
            eprintln!("Error: another daemon is already listening on {}", path.display());
            eprintln!("Run 'openkanban daemon status' to inspect it.");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    let pid_path = paths::pid_file_path();
    pidfile::write_pid_file(&pid_path).context("writing PID file")?;

    let board = BoardStore::open(paths::board_path());
    board.start_flush_task();

    let broker = Broker::new(Arc::clone(&board));

    agent_status::start_watcher(
        board,
        paths::agent_status_dir(),
        broker.shutdown_token(),
    );

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(web::DEFAULT_PORT);
    let web_broker = Arc::clone(&broker);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_broker, port).await {
            error!(error = %e, port, "HTTP surface failed");
        }
    });

    // SIGINT/SIGTERM run the broker's full shutdown: sessions stopped,
    // EXIT frames delivered, board flushed, queues closed. The accept loop
    // below returns once the connection tasks have drained.
    let sig_broker = Arc::clone(&broker);
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("Shutdown signal received");
        sig_broker.shutdown().await;
    });

    info!(socket = %socket.path().display(), port, "Daemon running");
    ipc::serve(Arc::clone(&broker), &socket).await;

    socket.remove();
    pidfile::remove_pid_file(&pid_path);
    info!("Daemon exited cleanly");
    Ok(())
}

/// Log to stderr and append to `~/.openkanban/daemon.log`.
fn init_tracing() -> anyhow::Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths::log_path())
        .context("opening daemon.log")?;

    let writer = std::io::stderr.and(Arc::new(log_file));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(())
}

fn install() -> anyhow::Result<()> {
    let mgr = service::manager()?;
    let bin_path = service::binary_path().context("resolving binary path")?;

    println!("Platform: {}", service::detect_platform());
    println!("Binary:   {}", bin_path.display());

    mgr.install(&bin_path.display().to_string())?;
    println!("Service installed.");
    println!("Run 'openkanban daemon start' to start the daemon.");
    Ok(())
}

fn uninstall() -> anyhow::Result<()> {
    let mgr = service::manager()?;
    mgr.uninstall()?;
    println!("Service uninstalled.");
    Ok(())
}

fn start() -> anyhow::Result<()> {
    let mgr = service::manager()?;
    if !mgr.is_installed() {
        anyhow::bail!("service not installed. Run 'openkanban daemon install' first");
    }
    mgr.start()?;
    println!("Service started.");
    Ok(())
}

fn stop() -> anyhow::Result<()> {
    let mgr = service::manager()?;
    mgr.stop()?;
    println!("Service stopped.");
    Ok(())
}

/// Print service and socket state. Always exits 0.
async fn status() -> anyhow::Result<()> {
    println!("Platform: {}", service::detect_platform());

    match service::manager() {
        Ok(mgr) => {
            println!("Installed: {}", mgr.is_installed());
            println!("Status: {}", mgr.status());
        }
        Err(e) => {
            println!("Installed: false");
            println!("Status: unknown ({e})");
        }
    }

    let socket_path = paths::socket_path();
    if socket_path.exists() {
        // A socket file can outlive its daemon; only a live connect counts.
        match DaemonClient::connect(&socket_path).await {
            Ok(_) => println!("Socket: {} (live)", socket_path.display()),
            Err(_) => println!("Socket: {} (stale)", socket_path.display()),
        }
    } else {
        println!("Socket: {} (not found)", socket_path.display());
    }

    if let Some(pid) = pidfile::read_live_pid(&paths::pid_file_path()) {
        println!("PID: {pid}");
    }

    Ok(())
}
