use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Phases surfaced to the UI while the backend is brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPhase {
    Checking,
    Installing,
    Starting,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub phase: BackendPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl BackendStatus {
    pub fn new(phase: BackendPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            progress: None,
        }
    }

    pub fn with_progress(phase: BackendPhase, message: impl Into<String>, progress: u8) -> Self {
        Self {
            phase,
            message: message.into(),
            progress: Some(progress),
        }
    }
}

/// How many non-ready messages are kept for the diagnostics view.
const RECENT_LOG_CAP: usize = 20;

const CHANNEL_CAP: usize = 256;

struct Inner {
    last: Option<BackendStatus>,
    recent: VecDeque<String>,
}

/// Single-writer, many-listener status channel. Listeners attach with
/// `subscribe` and see only events emitted after attachment; ordering
/// matches emission order. The broadcaster also keeps a small rolling log
/// of non-ready messages so the UI can show recent history on demand.
#[derive(Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<BackendStatus>,
    inner: Arc<Mutex<Inner>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAP);
        Self {
            tx,
            inner: Arc::new(Mutex::new(Inner {
                last: None,
                recent: VecDeque::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendStatus> {
        self.tx.subscribe()
    }

    pub fn emit(&self, status: BackendStatus) {
        {
            let mut g = self.inner.lock().unwrap();
            if status.phase != BackendPhase::Ready {
                if g.recent.len() == RECENT_LOG_CAP {
                    g.recent.pop_front();
                }
                g.recent.push_back(status.message.clone());
            }
            g.last = Some(status.clone());
        }
        // No receivers attached is fine; the rolling log still records it.
        let _ = self.tx.send(status);
    }

    pub fn last(&self) -> Option<BackendStatus> {
        self.inner.lock().unwrap().last.clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.last().map(|s| s.phase),
            Some(BackendPhase::Ready)
        )
    }

    pub fn recent_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().recent.iter().cloned().collect()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
