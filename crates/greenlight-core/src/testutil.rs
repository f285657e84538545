//! Shared test fixtures: a minimal in-process HTTP/1.1 responder.
//!
//! Each queued response is served to one connection (`Connection: close`),
//! and the request that triggered it is recorded for assertions.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub struct ReceivedRequest {
    pub path: String,
    pub body: serde_json::Value,
}

/// Bind a listener on an ephemeral local port.
pub async fn bind_local() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    (listener, base)
}

/// Serve the queued `(status, body)` responses in order, one connection
/// each, returning the recorded requests.
pub async fn serve_http(listener: TcpListener, responses: Vec<(u16, String)>) -> Vec<ReceivedRequest> {
    let mut received = Vec::new();
    for (status, body) in responses {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        let (head_end, content_len, path) = loop {
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "client closed before sending a full request");
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_string();
                let path = head
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();
                let content_len = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                break (pos + 4, content_len, path);
            }
        };
        while buf.len() < head_end + content_len {
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "client closed mid-body");
            buf.extend_from_slice(&tmp[..n]);
        }
        let request_body = serde_json::from_slice(&buf[head_end..head_end + content_len])
            .unwrap_or(serde_json::Value::Null);
        received.push(ReceivedRequest {
            path,
            body: request_body,
        });

        let reason = match status {
            200 => "OK",
            401 => "Unauthorized",
            403 => "Forbidden",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            _ => "Status",
        };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }
    received
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
