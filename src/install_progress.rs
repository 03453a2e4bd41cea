/// Coarse progress milestones derived from pip's line output.
///
/// pip gives no machine-readable progress, so installation progress is a
/// heuristic projection of its log lines onto a 30..=90 range. The classifier
/// is deliberately free of any process plumbing so it can be driven from
/// canned log fixtures.
#[derive(Debug)]
pub struct InstallProgress {
    value: u8,
}

pub const INSTALL_START: u8 = 30;
const DOWNLOAD_CAP: u8 = 80;
const COLLECTED: u8 = 85;
pub const INSTALL_DONE: u8 = 90;

impl InstallProgress {
    pub fn new() -> Self {
        Self {
            value: INSTALL_START,
        }
    }

    /// Current progress value; monotonically non-decreasing across `observe` calls.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Classify one trimmed pip output line. Returns the status message and
    /// progress to report, or `None` for lines that carry no milestone.
    pub fn observe(&mut self, line: &str) -> Option<(String, u8)> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Collecting ") {
            let pkg = rest.split_whitespace().next().unwrap_or("");
            return Some((format!("Collecting {pkg}"), self.value));
        }
        if let Some(rest) = line.strip_prefix("Downloading ") {
            let name = rest.split(" (").next().unwrap_or(rest);
            self.value = (self.value + 3).min(DOWNLOAD_CAP);
            return Some((format!("Downloading {name}"), self.value));
        }
        if line.starts_with("Installing collected packages") {
            self.value = self.value.max(COLLECTED);
            return Some(("Installing collected packages...".to_string(), self.value));
        }
        if line.starts_with("Successfully installed") {
            self.value = self.value.max(INSTALL_DONE);
            return Some(("Install complete".to_string(), self.value));
        }
        None
    }
}

impl Default for InstallProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_standard_pip_sequence() {
        let mut p = InstallProgress::new();

        let (msg, v) = p.observe("Collecting foo").unwrap();
        assert_eq!(msg, "Collecting foo");
        assert_eq!(v, 30);

        let (msg, v) = p.observe("Downloading foo (1.2 MB)").unwrap();
        assert_eq!(msg, "Downloading foo");
        assert_eq!(v, 33);

        let (_, v) = p.observe("Installing collected packages: foo").unwrap();
        assert_eq!(v, 85);

        let (msg, v) = p.observe("Successfully installed foo").unwrap();
        assert_eq!(msg, "Install complete");
        assert_eq!(v, 90);
    }

    #[test]
    fn progress_is_monotone_over_a_noisy_log() {
        let fixture = [
            "Collecting torch==2.1.0",
            "  Using cached torch-2.1.0-cp311-linux_x86_64.whl",
            "Downloading nvidia_cublas_cu12 (410.6 MB)",
            "   |████████████████| 410.6 MB 12.1 MB/s",
            "Collecting fastapi",
            "Downloading fastapi-0.104.1-py3-none-any.whl (92 kB)",
            "Requirement already satisfied: typing-extensions",
            "Installing collected packages: torch, fastapi",
            "Successfully installed fastapi-0.104.1 torch-2.1.0",
        ];
        let mut p = InstallProgress::new();
        let mut last = 0u8;
        let mut final_reported = 0u8;
        for line in fixture {
            if let Some((_, v)) = p.observe(line) {
                assert!(v >= last, "progress went backwards: {last} -> {v}");
                last = v;
                final_reported = v;
            }
        }
        assert!(final_reported >= 90);
    }

    #[test]
    fn downloads_alone_never_exceed_the_cap() {
        let mut p = InstallProgress::new();
        for i in 0..40 {
            p.observe(&format!("Downloading pkg{i} (1 MB)"));
        }
        assert_eq!(p.value(), 80);
    }

    #[test]
    fn non_milestone_lines_are_ignored() {
        let mut p = InstallProgress::new();
        assert!(p.observe("WARNING: pip is being invoked by an old script").is_none());
        assert!(p.observe("").is_none());
        assert_eq!(p.value(), 30);
    }
}
