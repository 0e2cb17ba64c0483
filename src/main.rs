//! simplevm: boot a Linux VM from a kernel, an initrd and disk images.
//!
//! `run` boots once from paths on the command line and attaches the serial
//! console to the terminal. `serve` keeps a coordinator alive behind the HTTP
//! API and the drop folder.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use simplevm::coordinator::{CoordinatorHandle, StartOutcome};
use simplevm::logging;
use simplevm::paths::SimplePaths;
use simplevm::server;
use simplevm::settings::{self, Settings};
use simplevm::state_machine::VmPhase;
use simplevm::vm::console::ConsoleHandle;
use simplevm::vm::drop_folder::{DropFolderWatcher, forward_drops, resolve_dropped};
use simplevm::vm::hypervisor::ExitReason;
use simplevm::vm::slots::Slot;
use simplevm::vm::vfkit::VfkitHypervisor;

/// Boot Linux VMs on macOS through vfkit
#[derive(Parser, Debug)]
#[command(
    name = "simplevm",
    version,
    about = "Boot a Linux VM from kernel, initrd and disk images"
)]
struct Cli {
    /// Config file (default: ~/.config/simplevm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot once and attach the serial console to this terminal
    Run {
        /// Kernel (vmlinuz); path or file:// URL
        #[arg(long)]
        kernel: Option<String>,
        /// Initial ramdisk
        #[arg(long)]
        initrd: Option<String>,
        /// Boot disk image
        #[arg(long)]
        image: Option<String>,
        /// Extra disk image
        #[arg(long)]
        extra: Option<String>,
        /// Do not attach the console
        #[arg(long)]
        no_console: bool,
    },
    /// Run the HTTP API and the drop folder until Ctrl-C
    Serve {
        /// Listen address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
        /// Drop folder (overrides the config file)
        #[arg(long)]
        drop_dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let paths = SimplePaths::resolve();
    let log_dir = paths
        .as_ref()
        .map(|p| p.logs.clone())
        .unwrap_or_else(std::env::temp_dir);
    let _log_guard = logging::init(&log_dir, "simplevm=info");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Error: failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(run_cli(cli, paths));
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));

    if let Err(e) = result {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli, paths: Option<SimplePaths>) -> Result<()> {
    if let Some(paths) = &paths {
        if let Err(e) = paths.ensure() {
            warn!("failed to create application directories: {e}");
        }
    }
    let config_file = match (&cli.config, &paths) {
        (Some(file), _) => file.clone(),
        (None, Some(paths)) => {
            settings::ensure_default_toml(&paths.config_file(), &settings::default_toml_content());
            paths.config_file()
        }
        (None, None) => bail!("HOME is not set; pass --config"),
    };
    let settings = Settings::load(&config_file)?;

    let hypervisor = Arc::new(VfkitHypervisor::new(
        settings.vfkit.binary.clone(),
        settings.vfkit.rest_port,
    ));
    let handle = CoordinatorHandle::spawn(
        settings.readiness.required.clone(),
        settings.machine.clone(),
        hypervisor,
    );

    match cli.command {
        Command::Run {
            kernel,
            initrd,
            image,
            extra,
            no_console,
        } => {
            let assigned = [
                (Slot::Kernel, kernel),
                (Slot::Initrd, initrd),
                (Slot::Image, image),
                (Slot::Extra, extra),
            ];
            for (slot, value) in assigned {
                if let Some(value) = value {
                    let path = resolve_dropped(&value).with_context(|| format!("--{slot}"))?;
                    handle.set_path(slot, path).await?;
                }
            }
            run_once(&handle, !no_console).await
        }
        Command::Serve { bind, drop_dir } => {
            let bind = bind.unwrap_or_else(|| settings.server.bind.clone());
            let drop_dir = drop_dir
                .or_else(|| settings.server.drop_dir.clone())
                .or_else(|| paths.as_ref().map(|p| p.drop.clone()))
                .context("no drop folder configured")?;
            serve(handle, &bind, drop_dir).await
        }
    }
}

async fn run_once(handle: &CoordinatorHandle, attach: bool) -> Result<()> {
    match handle.start().await? {
        StartOutcome::Started { description } => {
            info!(state = %description, "VM started");
        }
        StartOutcome::NotReady { missing } => {
            let missing: Vec<&str> = missing.iter().map(|s| s.label()).collect();
            bail!("not ready to start, missing: {}", missing.join(", "));
        }
        StartOutcome::AlreadyActive { phase } => bail!("VM already {phase:?}"),
        StartOutcome::Failed { message } => bail!("VM failed to start: {message}"),
    }

    if attach {
        if let Some(console) = handle.show_console().await? {
            attach_console(console);
        }
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("interrupted, stopping VM");
            handle.stop().await?;
        }
        result = handle.wait_for_phase(VmPhase::Idle) => {
            result?;
        }
    }

    let status = handle.status();
    if let Some(error) = status.last_error {
        bail!("{error}");
    }
    if let Some(ExitReason::Fault(message)) = status.last_exit {
        bail!("VM faulted: {message}");
    }
    info!("VM exited");
    Ok(())
}

/// Pipe console output to stdout and stdin to the guest.
fn attach_console(mut console: ConsoleHandle) {
    let input = console.input();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        if stdout.write_all(console.scrollback()).await.is_err() {
            return;
        }
        while let Some(bytes) = console.recv().await {
            if stdout.write_all(&bytes).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if input.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

async fn serve(handle: CoordinatorHandle, bind: &str, drop_dir: PathBuf) -> Result<()> {
    let (drop_tx, drop_rx) = mpsc::unbounded_channel();
    let watcher = DropFolderWatcher::start(drop_dir, drop_tx)?;
    info!(root = %watcher.root().display(), "drop folder ready");

    tokio::spawn(forward_drops(handle.clone(), drop_rx));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupted, shutting down");
    };
    server::serve(listener, handle.clone(), shutdown).await?;

    if handle.status().phase != VmPhase::Idle {
        handle.stop().await?;
    }
    Ok(())
}
