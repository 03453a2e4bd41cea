use std::{
    path::Path,
    process::Stdio,
};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::{
    config::BackendConfig,
    install_progress::{InstallProgress, INSTALL_DONE},
    runtime::PythonRuntime,
    status::{BackendPhase, BackendStatus, StatusBroadcaster},
    trace,
};

/// Bound on the captured installer stderr carried inside a ProvisionError.
const STDERR_TAIL_CHARS: usize = 500;

/// Creates the isolated python environment and installs the pinned
/// dependency manifest, skipping the installer when the persisted marker
/// hash matches the current manifest. An internal async mutex serializes
/// overlapping `ensure` calls; at most one provisioning attempt runs.
pub struct Provisioner {
    config: BackendConfig,
    status: StatusBroadcaster,
    gate: tokio::sync::Mutex<()>,
}

impl Provisioner {
    pub fn new(config: BackendConfig, status: StatusBroadcaster) -> Self {
        Self {
            config,
            status,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn ensure(&self, runtime: &PythonRuntime) -> Result<()> {
        let _serialized = self.gate.lock().await;
        let span = trace::Span::start(&self.config.data_dir, None, "Provision", "PV.ensure", None);
        match self.ensure_inner(runtime).await {
            Ok(()) => {
                span.ok(None);
                Ok(())
            }
            Err(e) => {
                span.err(&e.to_string(), None);
                Err(e)
            }
        }
    }

    async fn ensure_inner(&self, runtime: &PythonRuntime) -> Result<()> {
        let current_hash = requirements_hash(&self.config.requirements_path())?;
        let marker_path = self.config.marker_path();

        // Marker is trusted only when it matches the current manifest AND the
        // environment it describes actually exists.
        let mut already_installed = match std::fs::read_to_string(&marker_path) {
            Ok(stored) => stored.trim() == current_hash,
            Err(_) => false,
        };

        if !self.config.venv_python().exists() {
            self.emit(BackendStatus::with_progress(
                BackendPhase::Installing,
                "Creating virtual environment...",
                10,
            ));
            std::fs::create_dir_all(self.config.venv_dir())
                .context("E_PROVISION_FAILED: create venv dir failed")?;
            let venv_dir = self.config.venv_dir();
            let exit = run_streaming(
                &runtime.path,
                &["-m", "venv", &venv_dir.display().to_string()],
                |_line| {},
            )
            .await?;
            if !exit.success {
                return Err(anyhow!(
                    "E_PROVISION_FAILED: venv creation failed (exit {}): {}",
                    exit.code_label,
                    exit.stderr_tail
                ));
            }
            // A fresh venv always needs packages, whatever the marker says.
            already_installed = false;
        }

        if already_installed {
            self.emit(BackendStatus::with_progress(
                BackendPhase::Installing,
                "Packages already installed",
                INSTALL_DONE,
            ));
            return Ok(());
        }

        self.emit(BackendStatus::with_progress(
            BackendPhase::Installing,
            "Installing packages (first run can take 5-10 minutes)...",
            30,
        ));

        let pip = self.config.venv_pip();
        let requirements = self.config.requirements_path();
        let mut progress = InstallProgress::new();
        let status = self.status.clone();
        let exit = run_streaming(
            &pip,
            &["install", "-r", &requirements.display().to_string()],
            |line| {
                if let Some((message, value)) = progress.observe(line) {
                    status.emit(BackendStatus::with_progress(
                        BackendPhase::Installing,
                        message,
                        value,
                    ));
                }
            },
        )
        .await?;
        if !exit.success {
            return Err(anyhow!(
                "E_PROVISION_FAILED: pip install failed (exit {}): {}",
                exit.code_label,
                exit.stderr_tail
            ));
        }

        // Written only after a verified-successful install so a half-finished
        // one cannot pass for complete on the next launch.
        std::fs::write(&marker_path, &current_hash)
            .context("E_PROVISION_FAILED: write install marker failed")?;

        self.emit(BackendStatus::with_progress(
            BackendPhase::Installing,
            "Packages installed",
            INSTALL_DONE,
        ));
        Ok(())
    }

    fn emit(&self, status: BackendStatus) {
        self.status.emit(status);
    }
}

pub fn requirements_hash(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("E_PROVISION_FAILED: read manifest failed: {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(hex::encode(hasher.finalize()))
}

struct StreamedExit {
    success: bool,
    code_label: String,
    stderr_tail: String,
}

/// Spawn a child and feed its stdout/stderr to `on_line` line by line,
/// keeping a bounded tail of stderr for diagnostics.
async fn run_streaming<F: FnMut(&str)>(
    program: &Path,
    args: &[&str],
    mut on_line: F,
) -> Result<StreamedExit> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("E_PROVISION_FAILED: failed to spawn {}", program.display()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("E_PROVISION_FAILED: child stdout missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("E_PROVISION_FAILED: child stderr missing"))?;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<(bool, String)>(64);
    let tx_err = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((false, line)).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx_err.send((true, line)).await.is_err() {
                break;
            }
        }
    });

    let mut stderr_tail = String::new();
    while let Some((is_stderr, line)) = rx.recv().await {
        let trimmed = line.trim();
        if is_stderr {
            stderr_tail.push_str(&line);
            stderr_tail.push('\n');
            stderr_tail = tail_chars(&stderr_tail, STDERR_TAIL_CHARS);
        }
        if !trimmed.is_empty() {
            on_line(trimmed);
        }
    }

    let exit = child
        .wait()
        .await
        .context("E_PROVISION_FAILED: wait for child failed")?;
    Ok(StreamedExit {
        success: exit.success(),
        code_label: exit
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()),
        stderr_tail: stderr_tail.trim().to_string(),
    })
}

fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}
