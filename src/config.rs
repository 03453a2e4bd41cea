use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 18765;

/// Everything the orchestration core needs to know about where things live
/// and where the backend server listens. Tests construct this directly with
/// tempdir paths; production resolves from env overrides.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// App data directory: venv, install marker, trace log, settings store.
    pub data_dir: PathBuf,
    /// Directory holding the bundled python backend (main.py, requirements.txt).
    pub backend_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Explicit python interpreter; skips candidate probing when set.
    pub python_override: Option<PathBuf>,
}

impl BackendConfig {
    pub fn new(data_dir: impl Into<PathBuf>, backend_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backend_dir: backend_dir.into(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            python_override: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let data_dir = match std::env::var("WHISPERDECK_DATA_DIR") {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => default_data_dir()?,
        };
        let backend_dir = match std::env::var("WHISPERDECK_BACKEND_DIR") {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => default_backend_dir()?,
        };
        let python_override = std::env::var("WHISPERDECK_PYTHON")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        Ok(Self {
            python_override,
            ..Self::new(data_dir, backend_dir)
        })
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.data_dir.join("python-env")
    }

    /// Marker file holding the requirements hash of the last successful install.
    pub fn marker_path(&self) -> PathBuf {
        self.venv_dir().join(".installed")
    }

    pub fn venv_python(&self) -> PathBuf {
        venv_bin(&self.venv_dir(), "python")
    }

    pub fn venv_pip(&self) -> PathBuf {
        venv_bin(&self.venv_dir(), "pip")
    }

    pub fn requirements_path(&self) -> PathBuf {
        self.backend_dir.join("requirements.txt")
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn venv_bin(venv_dir: &Path, name: &str) -> PathBuf {
    if cfg!(windows) {
        venv_dir.join("Scripts").join(format!("{name}.exe"))
    } else {
        venv_dir.join("bin").join(name)
    }
}

fn default_data_dir() -> Result<PathBuf> {
    // Dev default: repo-root/tmp/whisperdeck-data
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    Ok(dir.join("tmp").join("whisperdeck-data"))
}

fn default_backend_dir() -> Result<PathBuf> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let candidate = dir.join("resources").join("backend");
    if candidate.exists() {
        return Ok(candidate);
    }
    Err(anyhow!(
        "E_BACKEND_DIR_NOT_FOUND: no bundled backend at {} (set WHISPERDECK_BACKEND_DIR)",
        candidate.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_hang_off_data_dir() {
        let cfg = BackendConfig::new("/tmp/wd-data", "/tmp/wd-backend");
        assert_eq!(cfg.venv_dir(), PathBuf::from("/tmp/wd-data/python-env"));
        assert_eq!(
            cfg.marker_path(),
            PathBuf::from("/tmp/wd-data/python-env/.installed")
        );
        assert_eq!(
            cfg.requirements_path(),
            PathBuf::from("/tmp/wd-backend/requirements.txt")
        );
    }

    #[test]
    fn venv_binaries_use_platform_layout() {
        let cfg = BackendConfig::new("/tmp/wd-data", "/tmp/wd-backend");
        let python = cfg.venv_python();
        if cfg!(windows) {
            assert!(python.ends_with("Scripts/python.exe"));
        } else {
            assert!(python.ends_with("bin/python"));
        }
    }

    #[test]
    fn base_url_uses_fixed_local_port_by_default() {
        let cfg = BackendConfig::new("/d", "/b");
        assert_eq!(cfg.base_url(), "http://127.0.0.1:18765");
    }
}
