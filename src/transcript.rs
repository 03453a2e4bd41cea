use serde::{Deserialize, Serialize};

/// One transcript segment as persisted and displayed. Field names are
/// camelCase to match the durable document shape the UI consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub id: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub translated_text: Option<String>,
}

impl TranscriptSegment {
    pub fn new(id: impl Into<String>, start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_ms,
            end_ms,
            text: text.into(),
            translated_text: None,
        }
    }
}

/// Backend timestamps arrive as seconds; display and storage use whole
/// milliseconds, rounded (not truncated).
pub fn sec_to_ms(sec: f64) -> u64 {
    (sec * 1000.0).round().max(0.0) as u64
}

/// Replace the segment with `target_id` by zero-or-more new segments
/// produced by a scoped re-transcription. An empty replacement set restores
/// the original. The result is re-sorted by ascending `start_ms`.
pub fn replace_segment(
    segments: &[TranscriptSegment],
    target_id: &str,
    replacements: Vec<TranscriptSegment>,
) -> Vec<TranscriptSegment> {
    let mut out: Vec<TranscriptSegment> = Vec::with_capacity(segments.len() + replacements.len());
    for seg in segments {
        if seg.id == target_id {
            if replacements.is_empty() {
                out.push(seg.clone());
            } else {
                out.extend(replacements.iter().cloned());
            }
        } else {
            out.push(seg.clone());
        }
    }
    out.sort_by_key(|s| s.start_ms);
    out
}
