//! Minimal HTTP/1.1 framing for the proxy channel.
//!
//! Only what the data plane needs: request heads written by hand, response
//! heads parsed line by line, bodies delimited by `Content-Length`.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Upper bound on a response head.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on response header lines.
const MAX_HEADERS: usize = 100;

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Numeric status code
    pub status: u16,
    /// Reason phrase (may be empty)
    pub reason: String,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Value of the first header named `name` (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parsed `Content-Length`, if present and valid.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// Whether the server will close the connection after this response.
    #[must_use]
    pub fn closes_connection(&self) -> bool {
        self.header("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }

    /// Whether the body uses chunked transfer coding.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// 2xx status.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Render a request head. `headers` are emitted in order after `Host`.
pub fn request_head(method: &str, path: &str, host: &str, headers: &[(&str, &str)]) -> String {
    let mut head = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

/// Read one final (non-1xx) response head.
///
/// Interim `1xx` responses are skipped.
///
/// # Errors
///
/// Returns `UnexpectedEof` if the peer closes before a full head arrives and
/// `InvalidData` for malformed or oversized heads.
pub async fn read_response_head<R>(reader: &mut R) -> io::Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let head = read_one_head(reader).await?;
        if !(100..200).contains(&head.status) {
            return Ok(head);
        }
        tracing::debug!(status = head.status, "Skipping interim response");
    }
}

async fn read_one_head<R>(reader: &mut R) -> io::Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0usize;
    let status_line = read_line(reader, &mut consumed).await?;
    let (status, reason) = parse_status_line(&status_line)?;

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader, &mut consumed).await?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(invalid("too many response headers"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(&format!("malformed header line '{line}'")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

async fn read_line<R>(reader: &mut R, consumed: &mut usize) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before response head",
        ));
    }
    *consumed += n;
    if *consumed > MAX_HEAD_BYTES {
        return Err(invalid("response head too large"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn parse_status_line(line: &str) -> io::Result<(u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(invalid(&format!("unexpected status line '{line}'")));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| invalid(&format!("unexpected status line '{line}'")))?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok((status, reason))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
