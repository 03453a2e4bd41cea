use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::BackendClient;
use crate::protocol::{StreamEvent, TranscribeRequest};
use crate::sse::SseDecoder;
use crate::trace;
use crate::transcript::{replace_segment, sec_to_ms, TranscriptSegment};

/// Segments are delivered to the UI in batches on this cadence rather than
/// one message per segment.
const BATCH_INTERVAL: Duration = Duration::from_millis(200);

/// Incremental progress forwarded to the caller while a job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Segments(Vec<TranscriptSegment>),
    ChunkProgress { current: u32, total: u32 },
    ModelDownloading {
        model: String,
        percent: u8,
        size_mb: Option<u64>,
    },
    ModelLoaded { model: String },
}

/// Terminal state of one transcription job. `Cancelled` is its own variant:
/// a stream torn down by our own cancel must never read as a transport
/// failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed {
        segments: Vec<TranscriptSegment>,
        language: String,
    },
    Cancelled,
    Failed {
        message: String,
    },
}

/// Collects segments between flush ticks. Pure accumulator; the session
/// drives the clock.
#[derive(Debug, Default)]
pub struct SegmentBatcher {
    pending: Vec<TranscriptSegment>,
}

impl SegmentBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, segment: TranscriptSegment) {
        self.pending.push(segment);
    }

    /// Take everything accumulated since the last flush. `None` when there
    /// is nothing to deliver, so quiet ticks send no message.
    pub fn flush(&mut self) -> Option<Vec<TranscriptSegment>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// One transcription job: submit, follow the event stream, deliver batched
/// updates, and resolve to a single outcome.
pub struct TranscriptionSession {
    client: BackendClient,
    token: CancellationToken,
    trace_dir: Option<PathBuf>,
}

impl TranscriptionSession {
    pub fn new(client: BackendClient) -> Self {
        Self {
            client,
            token: CancellationToken::new(),
            trace_dir: None,
        }
    }

    /// Enable span recording under the app data dir; each span carries the
    /// backend job id for correlation with supervisor and provisioner lines.
    pub fn with_trace_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(data_dir.into());
        self
    }

    /// Handle for cancelling the running job from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Run a job to completion. Cancellation is checked around the submit
    /// and while streaming; in both cases the backend is told to stop and
    /// the outcome is `Cancelled`, regardless of how the transport reacts
    /// to the teardown.
    pub async fn run(
        &self,
        request: TranscribeRequest,
        updates: mpsc::Sender<SessionUpdate>,
    ) -> SessionOutcome {
        let started = tokio::select! {
            _ = self.token.cancelled() => return SessionOutcome::Cancelled,
            res = self.client.submit(&request) => match res {
                Ok(started) => started,
                Err(e) => {
                    let message = e.to_string();
                    if let Some(dir) = &self.trace_dir {
                        trace::event(dir, None, "Session", "SESSION.submit", "err", None);
                    }
                    return SessionOutcome::Failed { message };
                }
            },
        };
        let job_id = started.job_id;
        let span = self.span("SESSION.run", &job_id);

        let outcome = tokio::select! {
            _ = self.token.cancelled() => {
                // Dropping the stream future closes the connection; the
                // DELETE stops the work server-side.
                self.client.cancel(&job_id).await;
                SessionOutcome::Cancelled
            }
            outcome = self.follow_stream(&job_id, &updates) => outcome,
        };

        if let Some(span) = span {
            match &outcome {
                SessionOutcome::Completed { segments, language } => span.ok(Some(
                    serde_json::json!({"segments": segments.len(), "language": language}),
                )),
                SessionOutcome::Cancelled => {
                    span.ok(Some(serde_json::json!({"cancelled": true})))
                }
                SessionOutcome::Failed { message } => span.err(message, None),
            }
        }
        outcome
    }

    fn span(&self, step: &str, job_id: &str) -> Option<trace::Span> {
        self.trace_dir
            .as_deref()
            .map(|dir| trace::Span::start(dir, Some(job_id), "Session", step, None))
    }

    /// Run a scoped job over one segment's time range and splice the result
    /// into `transcript`. Replacement segments get fresh ids so they never
    /// collide with survivors of the original pass. Cancellation and an
    /// empty result both leave the transcript unchanged.
    pub async fn retranscribe_segment(
        &self,
        file_path: &str,
        model: &str,
        transcript: &[TranscriptSegment],
        target_id: &str,
        updates: mpsc::Sender<SessionUpdate>,
    ) -> Result<Vec<TranscriptSegment>> {
        let target = transcript
            .iter()
            .find(|s| s.id == target_id)
            .ok_or_else(|| anyhow!("no segment with id {target_id}"))?;

        let request = TranscribeRequest::scoped(file_path, model, target.start_ms, target.end_ms);
        let outcome = self.run(request, updates).await;
        if let Some(dir) = &self.trace_dir {
            trace::event(
                dir,
                None,
                "Session",
                "SESSION.retranscribe",
                if matches!(outcome, SessionOutcome::Failed { .. }) {
                    "err"
                } else {
                    "ok"
                },
                Some(serde_json::json!({"target_id": target_id})),
            );
        }
        match outcome {
            SessionOutcome::Completed { mut segments, .. } => {
                // The scoped job numbers its segments from zero again; fresh
                // ids keep replacements from colliding with survivors of the
                // original pass.
                for seg in &mut segments {
                    seg.id = Uuid::new_v4().to_string();
                }
                Ok(replace_segment(transcript, target_id, segments))
            }
            SessionOutcome::Cancelled => Ok(transcript.to_vec()),
            SessionOutcome::Failed { message } => Err(anyhow!(message)),
        }
    }

    async fn follow_stream(
        &self,
        job_id: &str,
        updates: &mpsc::Sender<SessionUpdate>,
    ) -> SessionOutcome {
        let resp = match self.client.open_stream(job_id).await {
            Ok(resp) => resp,
            Err(e) => {
                return SessionOutcome::Failed {
                    message: e.to_string(),
                }
            }
        };
        let mut body = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut batcher = SegmentBatcher::new();
        let mut segments: Vec<TranscriptSegment> = Vec::new();

        let mut tick = tokio::time::interval(BATCH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Some(batch) = batcher.flush() {
                        let _ = updates.send(SessionUpdate::Segments(batch)).await;
                    }
                }
                chunk = body.next() => match chunk {
                    Some(Ok(chunk)) => {
                        for payload in decoder.push(&chunk) {
                            let event = match serde_json::from_str::<StreamEvent>(&payload) {
                                Ok(event) => event,
                                // Unknown event shapes are skipped, not fatal.
                                Err(_) => continue,
                            };
                            if let Some(outcome) = self
                                .apply_event(event, &mut batcher, &mut segments, updates)
                                .await
                            {
                                return outcome;
                            }
                        }
                    }
                    // A close observed after our own cancel is the teardown,
                    // not a transport failure.
                    Some(Err(e)) => {
                        if self.token.is_cancelled() {
                            return SessionOutcome::Cancelled;
                        }
                        return SessionOutcome::Failed {
                            message: format!("E_STREAM_CLOSED: event stream failed: {e}"),
                        };
                    }
                    None => {
                        if self.token.is_cancelled() {
                            return SessionOutcome::Cancelled;
                        }
                        return SessionOutcome::Failed {
                            message: "E_STREAM_CLOSED: event stream ended before completion"
                                .to_string(),
                        };
                    }
                },
            }
        }
    }

    /// Fold one event into session state. Returns the terminal outcome once
    /// the stream has resolved.
    async fn apply_event(
        &self,
        event: StreamEvent,
        batcher: &mut SegmentBatcher,
        segments: &mut Vec<TranscriptSegment>,
        updates: &mpsc::Sender<SessionUpdate>,
    ) -> Option<SessionOutcome> {
        match event {
            StreamEvent::Segment { id, start, end, text } => {
                let segment =
                    TranscriptSegment::new(id, sec_to_ms(start), sec_to_ms(end), text);
                segments.push(segment.clone());
                batcher.push(segment);
                None
            }
            StreamEvent::ChunkProgress { current, total } => {
                // Pending segments go out first so progress never points
                // past text the UI has not seen yet.
                if let Some(batch) = batcher.flush() {
                    let _ = updates.send(SessionUpdate::Segments(batch)).await;
                }
                let _ = updates
                    .send(SessionUpdate::ChunkProgress { current, total })
                    .await;
                None
            }
            StreamEvent::ModelDownloading {
                model,
                percent,
                size_mb,
            } => {
                let _ = updates
                    .send(SessionUpdate::ModelDownloading {
                        model,
                        percent,
                        size_mb,
                    })
                    .await;
                None
            }
            StreamEvent::ModelLoaded { model } => {
                let _ = updates.send(SessionUpdate::ModelLoaded { model }).await;
                None
            }
            StreamEvent::Done {
                language,
                cancelled,
                ..
            } => {
                if cancelled {
                    return Some(SessionOutcome::Cancelled);
                }
                if let Some(batch) = batcher.flush() {
                    let _ = updates.send(SessionUpdate::Segments(batch)).await;
                }
                Some(SessionOutcome::Completed {
                    segments: std::mem::take(segments),
                    language,
                })
            }
            StreamEvent::Error { message } => Some(SessionOutcome::Failed { message }),
        }
    }
}
