//! vfkit backend (macOS Virtualization.framework wrapper).
//!
//! Argument building and state parsing are platform independent. Spawning is
//! gated to macOS; elsewhere `boot` returns an explanatory error so the rest
//! of the codebase compiles unconditionally.
//!
//! ## Architecture
//!
//! ```text
//! VfkitHypervisor::boot(BootConfig)
//!     └─► tokio::process::Command  →  vfkit child process
//!             ├─► stdout pump     →  ConsoleHub (virtio-serial,stdio)
//!             ├─► stdin pump      ←  ConsoleHandle::send
//!             ├─► exit watch      →  RunNotice::Exited (owns the child)
//!             └─► health check    →  RunNotice::State  (GET /vm/state every 5 s)
//! VfkitRun::terminate()            →  PUT /vm/state {"state":"Stop"}, kill on failure
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::vm::hypervisor::{BootConfig, Hypervisor, Launched};

/// Prefix vfkit puts in front of every reported state.
const STATE_PREFIX: &str = "VirtualMachineState";

/// Spawns VMs through the `vfkit` binary.
#[derive(Debug, Clone)]
pub struct VfkitHypervisor {
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    binary: Option<PathBuf>,
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    rest_port: u16,
}

impl VfkitHypervisor {
    /// `binary` overrides the `$PATH` lookup; `rest_port` is where vfkit
    /// serves its management API.
    pub fn new(binary: Option<PathBuf>, rest_port: u16) -> Self {
        Self { binary, rest_port }
    }
}

#[async_trait]
impl Hypervisor for VfkitHypervisor {
    fn name(&self) -> &str {
        "vfkit"
    }

    async fn boot(&self, config: BootConfig) -> Result<Launched> {
        check_option_values(&config)?;
        imp::boot(self, config).await
    }
}

/// vfkit splits `--bootloader` and `--device` values on `,`, so a comma in
/// a path or in the kernel command line would be read as another option.
pub fn check_option_values(config: &BootConfig) -> Result<()> {
    let mut files = vec![("kernel", &config.kernel)];
    if let Some(initrd) = &config.initrd {
        files.push(("initrd", initrd));
    }
    if let Some(image) = &config.image {
        files.push(("image", image));
    }
    if let Some(extra) = &config.extra_image {
        files.push(("extra image", extra));
    }
    for (what, path) in files {
        if path.to_string_lossy().contains(',') {
            bail!(
                "{what} path contains ',' which vfkit cannot represent: {}",
                path.display()
            );
        }
    }

    let cmdline = config.effective_cmdline();
    if cmdline.contains(',') {
        bail!("kernel command line contains ',' which vfkit cannot represent: {cmdline}");
    }
    Ok(())
}

/// Build the vfkit argument list for `config`.
pub fn vfkit_args(config: &BootConfig, rest_port: u16) -> Vec<String> {
    let mut args = Vec::new();

    // Resources.
    args.push("--cpus".to_string());
    args.push(config.resources.cpus.to_string());
    args.push("--memory".to_string());
    args.push(config.resources.memory_mb.to_string());

    // Bootloader.
    let mut bootloader = format!("linux,kernel={}", config.kernel.display());
    if let Some(initrd) = &config.initrd {
        bootloader.push_str(&format!(",initrd={}", initrd.display()));
    }
    bootloader.push_str(&format!(",cmdline={}", config.effective_cmdline()));
    args.push("--bootloader".to_string());
    args.push(bootloader);

    // Disks (virtio-blk), boot image first.
    for disk in config.disks() {
        args.push("--device".to_string());
        args.push(format!("virtio-blk,path={}", disk.display()));
    }

    args.push("--device".to_string());
    args.push("virtio-net,nat".to_string());

    // Entropy device (required for kernel RNG).
    args.push("--device".to_string());
    args.push("virtio-rng".to_string());

    // Serial console on vfkit's own stdio.
    args.push("--device".to_string());
    args.push("virtio-serial,stdio".to_string());

    // REST API for state management.
    args.push("--restful-uri".to_string());
    args.push(format!("tcp://localhost:{rest_port}"));

    args
}

/// Turn a raw vfkit state (`VirtualMachineStateRunning`) into `Running`.
pub fn describe_vfkit_state(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix(STATE_PREFIX).unwrap_or(trimmed);
    if stripped.is_empty() {
        "Unknown".to_string()
    } else {
        stripped.to_string()
    }
}

/// Resolve the path to the `vfkit` binary.
///
/// Order: the configured path, then `$PATH`, then the Homebrew locations.
pub fn find_vfkit(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        bail!("configured vfkit binary does not exist: {}", path.display());
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':').filter(|d| !d.is_empty()) {
            let candidate = PathBuf::from(dir).join("vfkit");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    // Homebrew on Intel and Apple Silicon.
    let candidates: &[&str] = &["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"];

    for &path in candidates {
        if PathBuf::from(path).exists() {
            return Ok(PathBuf::from(path));
        }
    }

    bail!(
        "vfkit binary not found. Install it with: brew install vfkit\n\
         Or set [vfkit] binary in config.toml."
    )
}

// ---------------------------------------------------------------------------
// macOS implementation
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
mod imp {
    use std::collections::VecDeque;
    use std::fmt;
    use std::process::Stdio;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{Context, Result, anyhow, bail};
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
    use tokio::sync::{Notify, mpsc, watch};
    use tracing::{debug, info, warn};

    use super::{VfkitHypervisor, describe_vfkit_state, find_vfkit, vfkit_args};
    use crate::vm::console::{ConsoleHandle, ConsoleHub, DEFAULT_SCROLLBACK_BYTES};
    use crate::vm::hypervisor::{BootConfig, ExitReason, Launched, RunNotice, VmRun};

    const BOOT_TIMEOUT: Duration = Duration::from_secs(10);
    const BOOT_POLL: Duration = Duration::from_millis(250);
    const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
    const STOP_TIMEOUT: Duration = Duration::from_secs(30);
    const KILL_TIMEOUT: Duration = Duration::from_secs(5);
    const STDERR_TAIL_LINES: usize = 20;

    type StderrTail = Arc<Mutex<VecDeque<String>>>;

    /// A live vfkit process.
    pub struct VfkitRun {
        pid: Option<u32>,
        rest_port: u16,
        console: Arc<ConsoleHub>,
        kill: Arc<Notify>,
        exited: watch::Receiver<Option<ExitReason>>,
        client: reqwest::Client,
    }

    impl fmt::Debug for VfkitRun {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("VfkitRun")
                .field("pid", &self.pid)
                .field("rest_port", &self.rest_port)
                .finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl VmRun for VfkitRun {
        fn id(&self) -> String {
            match self.pid {
                Some(pid) => format!("vfkit:{pid}"),
                None => "vfkit".to_string(),
            }
        }

        /// Gracefully stop the VM via the vfkit REST API, then wait for the
        /// process to exit. If the REST call fails the process is killed.
        async fn terminate(&self) -> Result<()> {
            if self.exited.borrow().is_some() {
                return Ok(());
            }

            let url = format!("http://localhost:{}/vm/state", self.rest_port);
            let stop_result = self
                .client
                .put(&url)
                .json(&serde_json::json!({"state": "Stop"}))
                .timeout(Duration::from_secs(10))
                .send()
                .await;

            match stop_result {
                Ok(resp) => {
                    info!(
                        port = self.rest_port,
                        status = resp.status().as_u16(),
                        "VM stop request sent"
                    );
                }
                Err(e) => {
                    warn!(port = self.rest_port, error = %e, "REST stop failed, killing vfkit");
                    self.kill.notify_one();
                }
            }

            let mut exited = self.exited.clone();
            let clean = tokio::time::timeout(STOP_TIMEOUT, exited.wait_for(Option::is_some))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if clean {
                return Ok(());
            }

            warn!("VM did not exit within 30 s, killing");
            self.kill.notify_one();
            let killed = tokio::time::timeout(KILL_TIMEOUT, exited.wait_for(Option::is_some))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if !killed {
                bail!("vfkit (pid {:?}) did not exit after kill", self.pid);
            }
            Ok(())
        }

        fn console(&self) -> Result<ConsoleHandle> {
            Ok(self.console.attach())
        }
    }

    /// Fail fast on missing boot files so callers get a clear error.
    fn validate_paths(config: &BootConfig) -> Result<()> {
        let mut files = vec![("kernel", &config.kernel)];
        if let Some(initrd) = &config.initrd {
            files.push(("initrd", initrd));
        }
        if let Some(image) = &config.image {
            files.push(("image", image));
        }
        if let Some(extra) = &config.extra_image {
            files.push(("extra image", extra));
        }
        for (what, path) in files {
            if !path.is_file() {
                bail!("{what} does not exist or is not a file: {}", path.display());
            }
        }
        Ok(())
    }

    pub(super) async fn boot(hv: &VfkitHypervisor, config: BootConfig) -> Result<Launched> {
        validate_paths(&config)?;

        let vfkit = find_vfkit(hv.binary.as_deref())?;
        info!(path = %vfkit.display(), "Found vfkit binary");

        let mut cmd = Command::new(&vfkit);
        cmd.args(vfkit_args(&config, hv.rest_port));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().context("Failed to spawn vfkit process")?;
        let pid = child.id();

        let (console, input_rx) = ConsoleHub::new(DEFAULT_SCROLLBACK_BYTES);
        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));

        if let Some(stdout) = child.stdout.take() {
            spawn_output_pump(stdout, Arc::clone(&console));
        }
        if let Some(stdin) = child.stdin.take() {
            spawn_input_pump(stdin, input_rx);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_log(stderr, Arc::clone(&stderr_tail));
        }

        let (notice_tx, notices) = mpsc::unbounded_channel();
        let (exit_tx, exited) = watch::channel(None);
        let kill = Arc::new(Notify::new());

        spawn_exit_watch(
            child,
            Arc::clone(&kill),
            exit_tx,
            notice_tx.clone(),
            Arc::clone(&console),
        );

        info!(
            pid = ?pid,
            port = hv.rest_port,
            kernel = %config.kernel.display(),
            memory_mb = config.resources.memory_mb,
            cpus = config.resources.cpus,
            "VM spawned"
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        let description = match wait_for_rest(&client, hv.rest_port, exited.clone()).await {
            Ok(description) => description,
            Err(e) => {
                let tail = stderr_lines(&stderr_tail);
                if tail.is_empty() {
                    return Err(e);
                }
                return Err(e.context(format!("vfkit stderr:\n{tail}")));
            }
        };

        spawn_health_check(
            client.clone(),
            hv.rest_port,
            description.clone(),
            exited.clone(),
            notice_tx,
        );

        let run = VfkitRun {
            pid,
            rest_port: hv.rest_port,
            console,
            kill,
            exited,
            client,
        };

        Ok(Launched {
            run: Arc::new(run),
            description,
            notices,
        })
    }

    /// Poll the REST API until vfkit answers, the process exits, or the boot
    /// deadline passes. A live process that never answers is still accepted.
    async fn wait_for_rest(
        client: &reqwest::Client,
        rest_port: u16,
        exited: watch::Receiver<Option<ExitReason>>,
    ) -> Result<String> {
        let deadline = tokio::time::Instant::now() + BOOT_TIMEOUT;
        loop {
            let exit = exited.borrow().clone();
            if let Some(reason) = exit {
                return Err(anyhow!("vfkit exited during boot ({reason})"));
            }

            if let Some(state) = fetch_state(client, rest_port).await {
                debug!(port = rest_port, state = %state, "vfkit REST API is up");
                return Ok(state);
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(port = rest_port, "vfkit REST API did not answer during boot");
                return Ok("Running".to_string());
            }

            tokio::time::sleep(BOOT_POLL).await;
        }
    }

    /// `GET /vm/state`, returning the described state on success.
    async fn fetch_state(client: &reqwest::Client, rest_port: u16) -> Option<String> {
        let url = format!("http://localhost:{rest_port}/vm/state");
        let resp = client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            warn!(port = rest_port, http_status = resp.status().as_u16(), "VM state query non-2xx");
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        body.get("state")
            .and_then(|s| s.as_str())
            .map(describe_vfkit_state)
    }

    fn spawn_output_pump(mut stdout: ChildStdout, console: Arc<ConsoleHub>) {
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => console.publish(&buf[..n]),
                    Err(e) => {
                        warn!(target: "console", error = %e, "console read error");
                        break;
                    }
                }
            }
            console.close();
            debug!(target: "console", "console output closed");
        });
    }

    fn spawn_input_pump(mut stdin: ChildStdin, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
        tokio::spawn(async move {
            while let Some(bytes) = input.recv().await {
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!(target: "console", error = %e, "console input closed");
                    return;
                }
                let _ = stdin.flush().await;
            }
        });
    }

    fn spawn_stderr_log(stderr: ChildStderr, tail: StderrTail) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "vfkit", "{}", line);
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });
    }

    fn stderr_lines(tail: &StderrTail) -> String {
        let tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Own the child until it exits, then push the exit notice.
    fn spawn_exit_watch(
        mut child: Child,
        kill: Arc<Notify>,
        exit_tx: watch::Sender<Option<ExitReason>>,
        notices: mpsc::UnboundedSender<RunNotice>,
        console: Arc<ConsoleHub>,
    ) {
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.notified() => None,
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    warn!("killing vfkit process");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let reason = match status {
                Ok(s) if s.success() => ExitReason::Shutdown,
                Ok(s) => ExitReason::Fault(format!("vfkit exited with {s}")),
                Err(e) => ExitReason::Fault(format!("failed to wait for vfkit: {e}")),
            };
            info!(reason = %reason, "VM process exited");

            console.close();
            let _ = exit_tx.send(Some(reason.clone()));
            let _ = notices.send(RunNotice::Exited(reason));
        });
    }

    /// Poll `GET /vm/state` every 5 seconds and push description changes.
    fn spawn_health_check(
        client: reqwest::Client,
        rest_port: u16,
        mut last: String,
        mut exited: watch::Receiver<Option<ExitReason>>,
        notices: mpsc::UnboundedSender<RunNotice>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEALTH_INTERVAL) => {}
                    _ = exited.changed() => {}
                }

                if exited.borrow().is_some() {
                    debug!(port = rest_port, "health-check task exiting (VM stopped)");
                    return;
                }

                // Transient failures are expected while the guest boots.
                if let Some(state) = fetch_state(&client, rest_port).await {
                    if state != last {
                        info!(port = rest_port, state = %state, "VM state changed");
                        last = state.clone();
                        if notices.send(RunNotice::State(state)).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Non-macOS stub
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
mod imp {
    use anyhow::{Result, anyhow};

    use super::VfkitHypervisor;
    use crate::vm::hypervisor::{BootConfig, Launched};

    /// On non-macOS platforms this always returns an error.
    pub(super) async fn boot(_hv: &VfkitHypervisor, _config: BootConfig) -> Result<Launched> {
        Err(anyhow!("vfkit requires macOS (Virtualization.framework)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::hypervisor::MachineResources;

    fn boot_config() -> BootConfig {
        BootConfig {
            kernel: PathBuf::from("/vm/vmlinuz"),
            initrd: Some(PathBuf::from("/vm/initrd")),
            image: Some(PathBuf::from("/vm/root.img")),
            extra_image: Some(PathBuf::from("/vm/data.img")),
            resources: MachineResources {
                cpus: 4,
                memory_mb: 4096,
                cmdline: "console=hvc0".to_string(),
            },
        }
    }

    fn device_specs(args: &[String]) -> Vec<&str> {
        args.windows(2)
            .filter(|w| w[0] == "--device")
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn args_carry_resources_and_bootloader() {
        let args = vfkit_args(&boot_config(), 7711);

        assert_eq!(&args[..4], &["--cpus", "4", "--memory", "4096"]);
        let loader = args
            .iter()
            .position(|a| a == "--bootloader")
            .map(|i| args[i + 1].as_str())
            .unwrap();
        assert_eq!(
            loader,
            "linux,kernel=/vm/vmlinuz,initrd=/vm/initrd,cmdline=console=hvc0 root=/dev/vda"
        );
        assert_eq!(&args[args.len() - 2..], &["--restful-uri", "tcp://localhost:7711"]);
    }

    #[test]
    fn args_attach_boot_image_before_extra_image() {
        let args = vfkit_args(&boot_config(), 7711);
        assert_eq!(
            device_specs(&args),
            vec![
                "virtio-blk,path=/vm/root.img",
                "virtio-blk,path=/vm/data.img",
                "virtio-net,nat",
                "virtio-rng",
                "virtio-serial,stdio",
            ]
        );
    }

    #[test]
    fn kernel_only_boot_has_no_initrd_or_disks() {
        let config = BootConfig {
            initrd: None,
            image: None,
            extra_image: None,
            ..boot_config()
        };
        let args = vfkit_args(&config, 7711);
        assert!(args.contains(&"linux,kernel=/vm/vmlinuz,cmdline=console=hvc0".to_string()));
        assert!(!device_specs(&args).iter().any(|d| d.starts_with("virtio-blk")));
    }

    #[test]
    fn commas_in_paths_are_rejected() {
        let config = BootConfig {
            kernel: PathBuf::from("/vm/a,initrd=/etc/x"),
            ..boot_config()
        };
        let err = check_option_values(&config).unwrap_err().to_string();
        assert!(err.contains("kernel path contains ','"), "{err}");

        let config = BootConfig {
            image: Some(PathBuf::from("/vm/Ubuntu 22.04, arm64.img")),
            ..boot_config()
        };
        let err = check_option_values(&config).unwrap_err().to_string();
        assert!(err.contains("image path contains ','"), "{err}");

        assert!(check_option_values(&boot_config()).is_ok());
    }

    #[test]
    fn commas_in_cmdline_are_rejected() {
        let mut config = boot_config();
        config.resources.cmdline = "console=ttyS0,115200".to_string();
        let err = check_option_values(&config).unwrap_err().to_string();
        assert!(err.contains("kernel command line contains ','"), "{err}");
    }

    #[tokio::test]
    async fn boot_reports_comma_paths_before_spawning() {
        let hv = VfkitHypervisor::new(None, 7711);
        let config = BootConfig {
            extra_image: Some(PathBuf::from("/vm/disk,ro.img")),
            ..boot_config()
        };
        let err = hv.boot(config).await.err().unwrap().to_string();
        assert!(err.contains("extra image path contains ','"), "{err}");
    }

    #[test]
    fn describes_vfkit_states() {
        assert_eq!(describe_vfkit_state("VirtualMachineStateRunning"), "Running");
        assert_eq!(describe_vfkit_state(" VirtualMachineStatePaused\n"), "Paused");
        assert_eq!(describe_vfkit_state("Stopping"), "Stopping");
        assert_eq!(describe_vfkit_state("VirtualMachineState"), "Unknown");
    }

    #[test]
    fn configured_binary_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("vfkit");
        assert!(find_vfkit(Some(&missing)).is_err());

        std::fs::write(&missing, b"#!/bin/sh\n").unwrap();
        assert_eq!(find_vfkit(Some(&missing)).unwrap(), missing);
    }

    #[tokio::test]
    #[cfg(not(target_os = "macos"))]
    async fn boot_is_unsupported_off_macos() {
        let hv = VfkitHypervisor::new(None, 7711);
        let err = hv.boot(boot_config()).await.err().unwrap();
        assert!(err.to_string().contains("macOS"));
    }
}
