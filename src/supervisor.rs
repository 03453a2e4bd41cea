use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::{
    client::BackendClient,
    config::BackendConfig,
    provision::Provisioner,
    runtime,
    session::TranscriptionSession,
    status::{BackendPhase, BackendStatus, StatusBroadcaster},
    trace,
};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STARTUP_DEADLINE: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const STDERR_TAIL_CHARS: usize = 800;

/// Server lines that mark startup milestones worth surfacing.
const STARTUP_MILESTONES: [&str; 2] = ["Uvicorn running on", "Application startup complete"];

#[derive(Clone)]
struct SupervisorDeps {
    spawn_backend: fn(&BackendConfig) -> Result<Child>,
    reclaim_port: fn(u16),
    startup_deadline: Duration,
}

impl Default for SupervisorDeps {
    fn default() -> Self {
        Self {
            spawn_backend,
            reclaim_port,
            startup_deadline: STARTUP_DEADLINE,
        }
    }
}

struct Inner {
    child: Option<Child>,
    stderr_tail: Arc<Mutex<String>>,
}

/// Brings the python inference server up and down: runtime discovery,
/// environment provisioning, port arbitration, process spawn, readiness
/// polling, and a crash watch once ready. One backend per supervisor.
#[derive(Clone)]
pub struct Supervisor {
    config: BackendConfig,
    status: StatusBroadcaster,
    client: BackendClient,
    provisioner: Arc<Provisioner>,
    inner: Arc<Mutex<Inner>>,
    start_gate: Arc<tokio::sync::Mutex<()>>,
    deps: SupervisorDeps,
}

impl Supervisor {
    pub fn new(config: BackendConfig) -> Result<Self> {
        Self::with_deps(config, SupervisorDeps::default())
    }

    fn with_deps(config: BackendConfig, deps: SupervisorDeps) -> Result<Self> {
        let status = StatusBroadcaster::new();
        let client = BackendClient::new(config.base_url())?;
        let provisioner = Arc::new(Provisioner::new(config.clone(), status.clone()));
        Ok(Self {
            config,
            status,
            client,
            provisioner,
            inner: Arc::new(Mutex::new(Inner {
                child: None,
                stderr_tail: Arc::new(Mutex::new(String::new())),
            })),
            start_gate: Arc::new(tokio::sync::Mutex::new(())),
            deps,
        })
    }

    pub fn status(&self) -> &StatusBroadcaster {
        &self.status
    }

    pub fn client(&self) -> BackendClient {
        self.client.clone()
    }

    /// A session against this backend, recording trace spans under the same
    /// data dir as the supervisor's own.
    pub fn session(&self) -> TranscriptionSession {
        TranscriptionSession::new(self.client.clone()).with_trace_dir(&self.config.data_dir)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Drive the backend to ready. Overlapping calls serialize; a failed
    /// attempt tears down whatever it had spawned, emits an error status and
    /// returns the failure.
    pub async fn start(&self) -> Result<()> {
        let _serialized = self.start_gate.lock().await;
        let span = trace::Span::start(&self.config.data_dir, None, "Supervisor", "SUP.start", None);
        match self.start_inner().await {
            Ok(()) => {
                span.ok(None);
                Ok(())
            }
            Err(e) => {
                span.err(&e.to_string(), None);
                self.status
                    .emit(BackendStatus::new(BackendPhase::Error, e.to_string()));
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        self.status.emit(BackendStatus::new(
            BackendPhase::Checking,
            "Checking Python environment...",
        ));
        let rt = runtime::locate(&self.config).await.ok_or_else(|| {
            anyhow!("E_PYTHON_NOT_FOUND: no Python 3.8+ interpreter found (install python3 or set WHISPERDECK_PYTHON)")
        })?;
        self.status.emit(BackendStatus::new(
            BackendPhase::Checking,
            format!("Found {}", rt.version_label()),
        ));

        self.provisioner.ensure(&rt).await?;

        self.status.emit(BackendStatus::new(
            BackendPhase::Starting,
            "Starting transcription service...",
        ));

        // A healthy server already on our port is adopted as-is; a bound but
        // unhealthy port is reclaimed before we spawn our own.
        if self.client.health().await.is_ok() {
            self.emit_ready();
            return Ok(());
        }
        if port_in_use(&self.config.host, self.config.port).await {
            trace::event(
                &self.config.data_dir,
                None,
                "Supervisor",
                "SUP.reclaim_port",
                "ok",
                Some(serde_json::json!({"port": self.config.port})),
            );
            (self.deps.reclaim_port)(self.config.port);
            tokio::time::sleep(Duration::from_millis(200)).await;
            if port_in_use(&self.config.host, self.config.port).await {
                return Err(anyhow!(
                    "E_PORT_RECLAIM: port {} is held by another process that could not be stopped",
                    self.config.port
                ));
            }
        }

        // Drop any stale child from a previous attempt before spawning anew.
        if self.inner.lock().unwrap().child.is_some() {
            self.stop().await;
        }

        let mut child = (self.deps.spawn_backend)(&self.config)?;
        let tail = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stderr_reader(stderr, tail.clone());
        }
        {
            let mut g = self.inner.lock().unwrap();
            g.child = Some(child);
            g.stderr_tail = tail;
        }

        self.await_ready().await?;
        self.emit_ready();
        self.spawn_crash_watch();
        Ok(())
    }

    /// Poll `/health` until the server answers, the child dies, or the
    /// startup deadline passes.
    async fn await_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.deps.startup_deadline;
        loop {
            if let Some(exit) = self.try_wait_child() {
                // Give the stderr reader a moment to drain the pipe.
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Err(anyhow!(
                    "E_BACKEND_EXIT: transcription service exited during startup ({exit}): {}",
                    self.stderr_tail()
                ));
            }
            if self.client.health().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "E_STARTUP_TIMEOUT: transcription service did not become healthy in {}s: {}",
                    self.deps.startup_deadline.as_secs(),
                    self.stderr_tail()
                ));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Graceful stop: polite signal, bounded grace, hard kill, then port
    /// reclaim for anything the process tree left behind. Safe to call at
    /// any time, including when nothing is running.
    pub async fn stop(&self) {
        let child = self.inner.lock().unwrap().child.take();
        let Some(mut child) = child else {
            return;
        };
        trace::event(&self.config.data_dir, None, "Supervisor", "SUP.stop", "ok", None);

        if let Some(pid) = child.id() {
            terminate(pid);
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        (self.deps.reclaim_port)(self.config.port);
    }

    fn emit_ready(&self) {
        self.status.emit(BackendStatus::with_progress(
            BackendPhase::Ready,
            "Transcription service ready",
            100,
        ));
    }

    fn try_wait_child(&self) -> Option<String> {
        let mut g = self.inner.lock().unwrap();
        let child = g.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(exit)) => {
                g.child = None;
                Some(
                    exit.code()
                        .map(|c| format!("exit {c}"))
                        .unwrap_or_else(|| "signal".to_string()),
                )
            }
            _ => None,
        }
    }

    fn stderr_tail(&self) -> String {
        let tail = self.inner.lock().unwrap().stderr_tail.clone();
        let g = tail.lock().unwrap();
        g.trim().to_string()
    }

    fn spawn_stderr_reader(
        &self,
        stderr: tokio::process::ChildStderr,
        tail: Arc<Mutex<String>>,
    ) {
        let status = self.status.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                {
                    let mut g = tail.lock().unwrap();
                    g.push_str(&line);
                    g.push('\n');
                    if g.chars().count() > STDERR_TAIL_CHARS {
                        let cut: String =
                            g.chars().skip(g.chars().count() - STDERR_TAIL_CHARS).collect();
                        *g = cut;
                    }
                }
                if STARTUP_MILESTONES.iter().any(|m| line.contains(m)) && !status.is_ready() {
                    status.emit(BackendStatus::new(BackendPhase::Starting, line.trim()));
                }
            }
        });
    }

    /// After ready: watch for an unexpected exit and surface it. No
    /// automatic restart; the next explicit `start` recovers.
    fn spawn_crash_watch(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
                if this.inner.lock().unwrap().child.is_none() {
                    // Stopped deliberately; nothing to report.
                    return;
                }
                if let Some(exit) = this.try_wait_child() {
                    this.status.emit(BackendStatus::new(
                        BackendPhase::Error,
                        format!(
                            "E_BACKEND_EXIT: transcription service exited unexpectedly ({exit})"
                        ),
                    ));
                    trace::event(
                        &this.config.data_dir,
                        None,
                        "Supervisor",
                        "SUP.crash",
                        "err",
                        Some(serde_json::json!({"exit": exit})),
                    );
                    return;
                }
            }
        });
    }
}

/// TCP-level check used to tell "free port" from "bound but unhealthy".
async fn port_in_use(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            PORT_PROBE_TIMEOUT,
            tokio::net::TcpStream::connect((host, port)),
        )
        .await,
        Ok(Ok(_))
    )
}

fn spawn_backend(config: &BackendConfig) -> Result<Child> {
    let mut cmd = Command::new(config.venv_python());
    cmd.current_dir(&config.backend_dir)
        .args([
            "-m",
            "uvicorn",
            "main:app",
            "--host",
            &config.host,
            "--port",
            &config.port.to_string(),
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(paths) = cuda_library_path(&config.venv_dir()) {
        cmd.env("LD_LIBRARY_PATH", paths);
    }
    cmd.spawn().with_context(|| {
        format!(
            "E_BACKEND_EXIT: failed to launch transcription service via {}",
            config.venv_python().display()
        )
    })
}

/// GPU wheels ship their shared libraries under
/// `site-packages/nvidia/<pkg>/lib`; the server only finds them if those
/// directories are on the loader path.
fn cuda_library_path(venv_dir: &Path) -> Option<String> {
    let mut dirs = cuda_library_dirs(venv_dir);
    if dirs.is_empty() {
        return None;
    }
    dirs.sort();
    let mut parts: Vec<String> = dirs.iter().map(|p| p.display().to_string()).collect();
    if let Ok(existing) = std::env::var("LD_LIBRARY_PATH") {
        if !existing.is_empty() {
            parts.push(existing);
        }
    }
    Some(parts.join(":"))
}

fn cuda_library_dirs(venv_dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let lib_root = venv_dir.join("lib");
    let Ok(pythons) = std::fs::read_dir(&lib_root) else {
        return out;
    };
    for python_dir in pythons.flatten() {
        let nvidia = python_dir.path().join("site-packages").join("nvidia");
        let Ok(packages) = std::fs::read_dir(&nvidia) else {
            continue;
        };
        for pkg in packages.flatten() {
            let lib = pkg.path().join("lib");
            if lib.is_dir() {
                out.push(lib);
            }
        }
    }
    out
}

#[cfg(unix)]
fn terminate(pid: u32) {
    let _ = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(windows)]
fn terminate(_pid: u32) {
    // No polite signal on Windows; the grace timeout falls through to kill.
}

#[cfg(unix)]
fn reclaim_port(port: u16) {
    let _ = std::process::Command::new("fuser")
        .args(["-k", &format!("{port}/tcp")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(windows)]
fn reclaim_port(port: u16) {
    let Ok(out) = std::process::Command::new("netstat").args(["-ano"]).output() else {
        return;
    };
    let needle = format!(":{port}");
    for line in String::from_utf8_lossy(&out.stdout).lines() {
        if !line.contains(&needle) || !line.contains("LISTENING") {
            continue;
        }
        if let Some(pid) = line.split_whitespace().last() {
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", pid, "/F"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::provision::requirements_hash;
    use crate::testutil::{spawn_server, HttpReply};

    /// A data/backend pair that looks fully provisioned: manifest, venv
    /// interpreter, matching marker, and a fake python override so runtime
    /// discovery succeeds without a real interpreter.
    #[cfg(unix)]
    fn provisioned_config(td: &tempfile::TempDir) -> BackendConfig {
        use std::os::unix::fs::PermissionsExt;

        let data_dir = td.path().join("data");
        let backend_dir = td.path().join("backend");
        std::fs::create_dir_all(&backend_dir).unwrap();
        std::fs::write(backend_dir.join("requirements.txt"), "fastapi\n").unwrap();

        let mut cfg = BackendConfig::new(data_dir, backend_dir);
        std::fs::create_dir_all(cfg.venv_python().parent().unwrap()).unwrap();
        std::fs::write(cfg.venv_python(), b"x").unwrap();
        let hash = requirements_hash(&cfg.requirements_path()).unwrap();
        std::fs::write(cfg.marker_path(), hash).unwrap();

        let fake = td.path().join("python");
        std::fs::write(&fake, "#!/bin/sh\necho \"Python 3.11.4\"\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        cfg.python_override = Some(fake);
        cfg
    }

    async fn free_port() -> u16 {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        drop(l);
        port
    }

    fn sh(script: &str) -> Result<Child> {
        Ok(Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?)
    }

    fn no_reclaim(_port: u16) {}

    #[test]
    fn cuda_library_dirs_finds_vendor_libs() {
        let td = tempfile::tempdir().unwrap();
        let venv = td.path().join("python-env");
        for pkg in ["cublas", "cudnn"] {
            std::fs::create_dir_all(
                venv.join("lib/python3.11/site-packages/nvidia")
                    .join(pkg)
                    .join("lib"),
            )
            .unwrap();
        }
        // A package without a lib dir is skipped.
        std::fs::create_dir_all(venv.join("lib/python3.11/site-packages/nvidia/empty")).unwrap();

        let dirs = cuda_library_dirs(&venv);
        assert_eq!(dirs.len(), 2);
        assert!(dirs.iter().all(|d| d.ends_with("lib")));
        assert!(cuda_library_dirs(td.path().join("missing").as_path()).is_empty());
    }

    #[tokio::test]
    async fn port_in_use_tracks_listener_lifetime() {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        assert!(port_in_use("127.0.0.1", port).await);
        drop(l);
        assert!(!port_in_use("127.0.0.1", port).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn healthy_port_is_adopted_without_spawning() {
        fn refuse_spawn(_cfg: &BackendConfig) -> Result<Child> {
            panic!("must not spawn when a healthy server already holds the port");
        }

        let (addr, server) = spawn_server(Arc::new(|_, path, _| {
            assert_eq!(path, "/health");
            HttpReply::json(200, r#"{"status":"ok"}"#)
        }))
        .await;

        let td = tempfile::tempdir().unwrap();
        let mut cfg = provisioned_config(&td);
        cfg.port = addr.port();

        let sup = Supervisor::with_deps(
            cfg,
            SupervisorDeps {
                spawn_backend: refuse_spawn,
                reclaim_port: no_reclaim,
                startup_deadline: Duration::from_secs(5),
            },
        )
        .unwrap();

        sup.start().await.expect("adopt healthy port");
        assert!(sup.status().is_ready());
        let last = sup.status().last().unwrap();
        assert_eq!(last.progress, Some(100));
        server.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_python_fails_with_error_status() {
        let td = tempfile::tempdir().unwrap();
        let mut cfg = provisioned_config(&td);
        cfg.python_override = Some(td.path().join("no-such-python"));
        cfg.port = free_port().await;

        let sup = Supervisor::new(cfg).unwrap();
        let err = sup.start().await.unwrap_err();
        assert!(err.to_string().contains("E_PYTHON_NOT_FOUND"), "{err}");
        let last = sup.status().last().unwrap();
        assert_eq!(last.phase, BackendPhase::Error);
        assert!(last.message.contains("E_PYTHON_NOT_FOUND"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_path_reaches_ready_then_stop_reaps_the_child() {
        static SPAWNED: AtomicBool = AtomicBool::new(false);
        fn stub_spawn(_cfg: &BackendConfig) -> Result<Child> {
            SPAWNED.store(true, Ordering::SeqCst);
            sh("sleep 60")
        }

        // Health answers only once our process is supposedly up, so the
        // initial probe does not short-circuit into the adoption path.
        let (addr, server) = spawn_server(Arc::new(|_, _, _| {
            if SPAWNED.load(Ordering::SeqCst) {
                HttpReply::json(200, r#"{"status":"ok"}"#)
            } else {
                HttpReply::json(503, "{}")
            }
        }))
        .await;

        let td = tempfile::tempdir().unwrap();
        let mut cfg = provisioned_config(&td);
        cfg.port = addr.port();

        let sup = Supervisor::with_deps(
            cfg,
            SupervisorDeps {
                spawn_backend: stub_spawn,
                reclaim_port: no_reclaim,
                startup_deadline: Duration::from_secs(10),
            },
        )
        .unwrap();

        sup.start().await.expect("ready");
        assert!(SPAWNED.load(Ordering::SeqCst));
        assert!(sup.status().is_ready());
        assert!(sup.inner.lock().unwrap().child.is_some());

        sup.stop().await;
        assert!(sup.inner.lock().unwrap().child.is_none());
        // Idempotent.
        sup.stop().await;
        server.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bound_but_unhealthy_port_is_reclaimed_and_verified() {
        static RECLAIMED: AtomicBool = AtomicBool::new(false);
        fn spy_reclaim(_port: u16) {
            // Spy only: leaves the occupant running so the verification
            // after reclaim must report the failure.
            RECLAIMED.store(true, Ordering::SeqCst);
        }
        fn refuse_spawn(_cfg: &BackendConfig) -> Result<Child> {
            panic!("must not spawn while the port is still occupied");
        }

        let (addr, server) =
            spawn_server(Arc::new(|_, _, _| HttpReply::json(500, "{}"))).await;

        let td = tempfile::tempdir().unwrap();
        let mut cfg = provisioned_config(&td);
        cfg.port = addr.port();

        let sup = Supervisor::with_deps(
            cfg,
            SupervisorDeps {
                spawn_backend: refuse_spawn,
                reclaim_port: spy_reclaim,
                startup_deadline: Duration::from_secs(1),
            },
        )
        .unwrap();

        let err = sup.start().await.unwrap_err();
        assert!(err.to_string().contains("E_PORT_RECLAIM"), "{err}");
        assert!(RECLAIMED.load(Ordering::SeqCst));
        server.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn premature_exit_surfaces_stderr_tail() {
        fn stub_spawn(_cfg: &BackendConfig) -> Result<Child> {
            sh("echo 'ModuleNotFoundError: No module named uvicorn' >&2; exit 3")
        }

        let td = tempfile::tempdir().unwrap();
        let mut cfg = provisioned_config(&td);
        cfg.port = free_port().await;

        let sup = Supervisor::with_deps(
            cfg,
            SupervisorDeps {
                spawn_backend: stub_spawn,
                reclaim_port: no_reclaim,
                startup_deadline: Duration::from_secs(10),
            },
        )
        .unwrap();

        let err = sup.start().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("E_BACKEND_EXIT"), "{msg}");
        assert!(msg.contains("exit 3"), "{msg}");
        assert!(msg.contains("ModuleNotFoundError"), "{msg}");
        assert_eq!(sup.status().last().unwrap().phase, BackendPhase::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn startup_timeout_fails_and_tears_down() {
        fn stub_spawn(_cfg: &BackendConfig) -> Result<Child> {
            sh("sleep 60")
        }

        let td = tempfile::tempdir().unwrap();
        let mut cfg = provisioned_config(&td);
        cfg.port = free_port().await;

        let sup = Supervisor::with_deps(
            cfg,
            SupervisorDeps {
                spawn_backend: stub_spawn,
                reclaim_port: no_reclaim,
                startup_deadline: Duration::from_secs(1),
            },
        )
        .unwrap();

        let err = sup.start().await.unwrap_err();
        assert!(err.to_string().contains("E_STARTUP_TIMEOUT"), "{err}");
        // The failed attempt cleaned up after itself.
        assert!(sup.inner.lock().unwrap().child.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crash_after_ready_flips_status_to_error_without_restart() {
        static SPAWNED: AtomicBool = AtomicBool::new(false);
        fn stub_spawn(_cfg: &BackendConfig) -> Result<Child> {
            SPAWNED.store(true, Ordering::SeqCst);
            sh("sleep 0.3")
        }

        let (addr, server) = spawn_server(Arc::new(|_, _, _| {
            if SPAWNED.load(Ordering::SeqCst) {
                HttpReply::json(200, r#"{"status":"ok"}"#)
            } else {
                HttpReply::json(503, "{}")
            }
        }))
        .await;

        let td = tempfile::tempdir().unwrap();
        let mut cfg = provisioned_config(&td);
        cfg.port = addr.port();

        let sup = Supervisor::with_deps(
            cfg,
            SupervisorDeps {
                spawn_backend: stub_spawn,
                reclaim_port: no_reclaim,
                startup_deadline: Duration::from_secs(10),
            },
        )
        .unwrap();

        let mut rx = sup.status().subscribe();
        sup.start().await.expect("ready");

        let crashed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let s = rx.recv().await.unwrap();
                if s.phase == BackendPhase::Error {
                    return s;
                }
            }
        })
        .await
        .expect("crash watch should report the exit");
        assert!(crashed.message.contains("E_BACKEND_EXIT"), "{}", crashed.message);
        assert!(sup.inner.lock().unwrap().child.is_none());
        server.abort();
    }
}
