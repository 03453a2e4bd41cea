use serde::{Deserialize, Serialize};

/// Body of `POST /transcribe`. `start_ms`/`end_ms` scope the job to a time
/// range for per-segment re-transcription.
#[derive(Debug, Clone, Serialize)]
pub struct TranscribeRequest {
    pub file_path: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<u64>,
}

impl TranscribeRequest {
    pub fn full(file_path: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            model: model.into(),
            start_ms: None,
            end_ms: None,
        }
    }

    pub fn scoped(
        file_path: impl Into<String>,
        model: impl Into<String>,
        start_ms: u64,
        end_ms: u64,
    ) -> Self {
        Self {
            start_ms: Some(start_ms),
            end_ms: Some(end_ms),
            ..Self::full(file_path, model)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscribeStarted {
    pub job_id: String,
}

/// `GET /health` payload; `cuda_available`/`gpu_name` feed the UI display.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthInfo {
    pub status: String,
    #[serde(default)]
    pub cuda_available: bool,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub model_loaded: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Gpu,
    Cpu,
}

/// `GET /usage` payload, polled every ~2s once the backend is ready.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageInfo {
    #[serde(rename = "type")]
    pub kind: UsageKind,
    pub percent: Option<f64>,
}

/// One SSE payload on `GET /transcribe/{job_id}/stream`. Timestamps cross
/// this boundary as seconds; conversion to milliseconds happens on receipt.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ModelDownloading {
        model: String,
        percent: u8,
        #[serde(default)]
        size_mb: Option<u64>,
    },
    ModelLoaded {
        model: String,
    },
    Segment {
        id: String,
        start: f64,
        end: f64,
        text: String,
    },
    ChunkProgress {
        current: u32,
        total: u32,
    },
    Done {
        #[serde(default)]
        language: String,
        #[serde(default)]
        cancelled: bool,
        #[serde(default)]
        total_segments: Option<u64>,
    },
    Error {
        message: String,
    },
}
