use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{config::BackendConfig, trace};

/// Minimum interpreter floor: the bundled backend needs python >= 3.8.
const MIN_MAJOR: u32 = 3;
const MIN_MINOR: u32 = 8;

/// How long a single `--version` probe may take before the candidate is
/// written off as absent.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const CANDIDATES: [&str; 2] = ["python3", "python"];

#[derive(Debug, Clone)]
pub struct PythonRuntime {
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
}

impl PythonRuntime {
    pub fn version_label(&self) -> String {
        format!("Python {}.{}", self.major, self.minor)
    }
}

/// Probe candidate interpreters and return the first one that satisfies the
/// version floor. Probe failures, timeouts and unparsable output all mean
/// the same thing to callers: no usable runtime. Cheap, so re-run fresh on
/// every supervisor start; no caching, no retries.
pub async fn locate(config: &BackendConfig) -> Option<PythonRuntime> {
    let candidates: Vec<PathBuf> = match &config.python_override {
        Some(p) => vec![p.clone()],
        None => CANDIDATES.iter().map(PathBuf::from).collect(),
    };

    for candidate in candidates {
        match probe(&candidate).await {
            Some(rt) if meets_floor(rt.major, rt.minor) => {
                trace::event(
                    &config.data_dir,
                    None,
                    "Runtime",
                    "RT.locate",
                    "ok",
                    Some(serde_json::json!({
                        "python": rt.path.display().to_string(),
                        "version": rt.version_label(),
                    })),
                );
                return Some(rt);
            }
            _ => {}
        }
    }

    trace::event(
        &config.data_dir,
        None,
        "Runtime",
        "RT.locate",
        "err",
        Some(serde_json::json!({"code": "E_PYTHON_NOT_FOUND"})),
    );
    None
}

async fn probe(candidate: &Path) -> Option<PythonRuntime> {
    let run = tokio::process::Command::new(candidate)
        .arg("--version")
        .kill_on_drop(true)
        .output();
    let out = tokio::time::timeout(PROBE_TIMEOUT, run).await.ok()?.ok()?;
    if !out.status.success() {
        return None;
    }
    // Older interpreters print the version banner on stderr.
    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    let merged = if stdout.trim().is_empty() {
        stderr.to_string()
    } else {
        stdout.to_string()
    };
    let (major, minor) = parse_version(merged.lines().next().unwrap_or(""))?;
    Some(PythonRuntime {
        path: candidate.to_path_buf(),
        major,
        minor,
    })
}

fn meets_floor(major: u32, minor: u32) -> bool {
    major > MIN_MAJOR || (major == MIN_MAJOR && minor >= MIN_MINOR)
}

fn parse_version(line: &str) -> Option<(u32, u32)> {
    let rest = line.trim().strip_prefix("Python ")?;
    let mut parts = rest.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Some((major, minor.parse().ok()?))
}
