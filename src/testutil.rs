//! Tiny hand-rolled HTTP server for exercising the client, session and
//! supervisor against canned backend behavior. Speaks just enough
//! HTTP/1.1: one request per connection, `Connection: close` on every
//! response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum StreamItem {
    /// One SSE event: written as `data: <payload>` plus blank line.
    Data(String),
    /// Pause between events.
    Sleep(u64),
    /// Keep the connection open until the peer goes away.
    Hold,
}

#[derive(Debug, Clone)]
pub enum ReplyBody {
    Json(String),
    Sse(Vec<StreamItem>),
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: ReplyBody,
}

impl HttpReply {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: ReplyBody::Json(body.into()),
        }
    }

    pub fn sse(items: Vec<StreamItem>) -> Self {
        Self {
            status: 200,
            body: ReplyBody::Sse(items),
        }
    }
}

pub type Handler = Arc<dyn Fn(&str, &str, &str) -> HttpReply + Send + Sync>;

/// Bind an ephemeral local port and serve `handler(method, path, body)`.
pub async fn spawn_server(handler: Handler) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let _ = serve_one(stream, handler).await;
            });
        }
    });
    (addr, task)
}

async fn serve_one(mut stream: tokio::net::TcpStream, handler: Handler) -> std::io::Result<()> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_head_end(&raw) {
            break pos;
        }
        if raw.len() > 64 * 1024 {
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            if k.eq_ignore_ascii_case("content-length") {
                v.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = raw[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    let body = String::from_utf8_lossy(&body).to_string();

    let reply = handler(&method, &path, &body);
    match reply.body {
        ReplyBody::Json(json) => {
            let head = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reply.status,
                json.len()
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(json.as_bytes()).await?;
            stream.flush().await?;
        }
        ReplyBody::Sse(items) => {
            let head = format!(
                "HTTP/1.1 {} X\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
                reply.status
            );
            stream.write_all(head.as_bytes()).await?;
            stream.flush().await?;
            for item in items {
                match item {
                    StreamItem::Data(payload) => {
                        stream
                            .write_all(format!("data: {payload}\n\n").as_bytes())
                            .await?;
                        stream.flush().await?;
                    }
                    StreamItem::Sleep(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    StreamItem::Hold => {
                        // Park until the client hangs up.
                        let mut probe = [0u8; 1];
                        let _ = stream.read(&mut probe).await;
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}
