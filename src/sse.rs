/// Minimal incremental decoder for `text/event-stream` bodies.
///
/// The backend only ever sends `data:` fields with one JSON object per
/// event, but the decoder still handles the general framing: events are
/// separated by a blank line, a field may arrive split across transport
/// chunks, multi-line `data:` fields are joined with newlines, and comment
/// lines (leading `:`) and non-data fields are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk, returning the data payloads of every event
    /// completed by it, in arrival order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut out = Vec::new();
        loop {
            let Some((frame_end, sep_len)) = find_frame_end(&self.buf) else {
                break;
            };
            let frame: String = self.buf.drain(..frame_end + sep_len).collect();
            if let Some(data) = parse_frame(&frame[..frame_end]) {
                out.push(data);
            }
        }
        out
    }
}

/// Locate the first blank-line separator, tolerating LF and CRLF framing.
fn find_frame_end(buf: &str) -> Option<(usize, usize)> {
    let lf = buf.find("\n\n").map(|i| (i, 2));
    let crlf = buf.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(frame: &str) -> Option<String> {
    let mut data_lines: Vec<&str> = Vec::new();
    for line in frame.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
