//! Data-plane channel to the image proxy.
//!
//! A [`ProxyChannel`] owns one long-lived HTTP/1.1 connection to the proxy
//! named by a session's proxy URL. Every request carries the session's
//! signed ticket as a bearer credential.
//!
//! ## Wire contract
//!
//! - Download: `GET <path>` with `Range: bytes=<start>-<end>`; 2xx with a
//!   body of the requested length is success, anything `>= 300` is failure.
//! - Upload: one `PUT <path>` head with
//!   `Content-Range: bytes 0-<total-1>/<total>` and `Content-Length: <total>`,
//!   then the body streamed chunk by chunk on the same connection, then one
//!   final response.

pub mod http;
mod tls;

pub use tls::{ProxyIo, TlsProxyConnector};

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use crate::error::{Error, Result};
use crate::session::SignedTicket;

use self::http::{read_response_head, request_head, ResponseHead};

/// Largest body read from a response that carries no chunk data.
pub const MAX_REPLY_BODY: u64 = 64 * 1024;

/// Status and body of one data-plane response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body; empty when an error body had no framing
    pub body: Vec<u8>,
}

impl ChunkResponse {
    /// Status below 300.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status < 300
    }
}

/// The byte-moving half of a transfer.
///
/// Implemented by [`ProxyChannel`]; the engine is generic over it so that
/// alternative transports and test doubles plug in unchanged.
pub trait DataChannel: Send {
    /// Fetch the inclusive byte range `start..=end`.
    fn download_chunk(
        &mut self,
        start: u64,
        end: u64,
    ) -> impl Future<Output = Result<ChunkResponse>> + Send;

    /// Send the upload request head for a body of `total_size` bytes.
    fn upload_prepare(&mut self, total_size: u64) -> impl Future<Output = Result<()>> + Send;

    /// Write the next slice of the upload body.
    fn upload_chunk(&mut self, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Flush the upload body and read the final response.
    fn upload_finish(&mut self) -> impl Future<Output = Result<ChunkResponse>> + Send;

    /// Close the connection. Further operations fail.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens a [`DataChannel`] for a session.
pub trait ChannelConnector: Send + Sync {
    /// Channel type produced by this connector.
    type Channel: DataChannel;

    /// Connect to `proxy_url`, authenticating with `ticket`.
    fn connect(
        &self,
        proxy_url: &str,
        ticket: &SignedTicket,
    ) -> impl Future<Output = Result<Self::Channel>> + Send;
}

/// A parsed proxy URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Host name or IP address (no brackets)
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Request target (path and query)
    pub path: String,
    /// Whether the connection uses TLS
    pub tls: bool,
}

impl ProxyEndpoint {
    /// Parse an `http://` or `https://` proxy URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for unparsable URLs, other schemes or
    /// URLs without a host.
    pub fn parse(proxy_url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(proxy_url)
            .map_err(|e| Error::InvalidInput(format!("invalid proxy URL '{proxy_url}': {e}")))?;

        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(Error::InvalidInput(format!(
                    "unsupported proxy URL scheme '{other}'"
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("proxy URL '{proxy_url}' has no host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidInput(format!("proxy URL '{proxy_url}' has no port")))?;

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            port,
            path,
            tls,
        })
    }

    /// Value for the `Host` header.
    #[must_use]
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct UploadState {
    total: u64,
    sent: u64,
}

/// HTTP/1.1 channel to the proxy over any byte stream.
pub struct ProxyChannel<S> {
    stream: Option<BufStream<S>>,
    host: String,
    path: String,
    authorization: String,
    extra_headers: Vec<(String, String)>,
    upload: Option<UploadState>,
}

impl<S> std::fmt::Debug for ProxyChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyChannel")
            .field("host", &self.host)
            .field("path", &self.path)
            .field("open", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

impl<S> ProxyChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established stream to `endpoint`.
    pub fn new(stream: S, endpoint: &ProxyEndpoint, ticket: &SignedTicket) -> Self {
        Self {
            stream: Some(BufStream::new(stream)),
            host: endpoint.host_header(),
            path: endpoint.path.clone(),
            authorization: ticket.authorization(),
            extra_headers: Vec::new(),
            upload: None,
        }
    }

    /// Send an additional header with every request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Whether the connection is still usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn head(&self, method: &str, specific: &[(&str, &str)]) -> String {
        let mut headers: Vec<(&str, &str)> = vec![("Authorization", self.authorization.as_str())];
        headers.extend_from_slice(specific);
        headers.extend(
            self.extra_headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        request_head(method, &self.path, &self.host, &headers)
    }

    fn stream_at(&mut self, offset: u64) -> Result<&mut BufStream<S>> {
        self.stream.as_mut().ok_or_else(|| Error::TransferAborted {
            offset,
            reason: "channel is closed".to_string(),
        })
    }

    /// Read a response head and its body, leaving the connection positioned
    /// at the next response.
    ///
    /// A success response must carry exactly `expected` bytes when given.
    /// Other bodies are capped at [`MAX_REPLY_BODY`]; an oversized error
    /// body is dropped along with the connection.
    async fn read_response(
        &mut self,
        offset: u64,
        expected: Option<u64>,
    ) -> Result<(ResponseHead, Vec<u8>)> {
        let stream = self.stream_at(offset)?;
        let head = read_response_head(stream)
            .await
            .map_err(|e| aborted(offset, &e))?;

        let limit = match expected {
            Some(len) if head.is_success() => len,
            _ => MAX_REPLY_BODY,
        };

        let body = match head.content_length() {
            Some(len) if head.is_success() && expected.is_some_and(|n| n != len) => {
                self.stream = None;
                return Err(Error::TransferAborted {
                    offset,
                    reason: format!("expected {limit} bytes, proxy announced {len}"),
                });
            }
            Some(len) if len > limit => {
                self.stream = None;
                if head.is_success() {
                    return Err(Error::Protocol(format!(
                        "proxy response {} body of {len} bytes exceeds {limit}",
                        head.status
                    )));
                }
                tracing::debug!(status = head.status, len, "Discarding oversized error body");
                Vec::new()
            }
            Some(len) => {
                let len = usize::try_from(len).map_err(|_| {
                    Error::Protocol(format!("response body of {len} bytes does not fit in memory"))
                })?;
                let mut body = vec![0u8; len];
                stream
                    .read_exact(&mut body)
                    .await
                    .map_err(|e| aborted(offset, &e))?;
                body
            }
            None if head.is_success() && head.closes_connection() && !head.is_chunked() => {
                // Body runs to end of stream.
                let mut body = Vec::new();
                (&mut *stream)
                    .take(limit + 1)
                    .read_to_end(&mut body)
                    .await
                    .map_err(|e| aborted(offset, &e))?;
                self.stream = None;
                if expected.is_none() && body.len() as u64 > limit {
                    return Err(Error::Protocol(format!(
                        "proxy response {} body exceeds {limit} bytes",
                        head.status
                    )));
                }
                body
            }
            None if head.is_success() => {
                self.stream = None;
                return Err(Error::Protocol(format!(
                    "proxy response {} has no Content-Length",
                    head.status
                )));
            }
            None => {
                // Unframed error body: the connection cannot be reused.
                self.stream = None;
                Vec::new()
            }
        };

        if head.closes_connection() {
            self.stream = None;
        }

        Ok((head, body))
    }
}

impl<S> DataChannel for ProxyChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn download_chunk(&mut self, start: u64, end: u64) -> Result<ChunkResponse> {
        if end < start {
            return Err(Error::InvalidInput(format!("empty range {start}-{end}")));
        }

        let range = format!("bytes={start}-{end}");
        let request = self.head("GET", &[("Range", range.as_str())]);
        tracing::debug!(%range, "Requesting chunk");

        let stream = self.stream_at(start)?;
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| aborted(start, &e))?;
        stream.flush().await.map_err(|e| aborted(start, &e))?;

        let (head, body) = self.read_response(start, Some(end - start + 1)).await?;
        if head.is_success() {
            let expected = end - start + 1;
            if body.len() as u64 != expected {
                return Err(Error::TransferAborted {
                    offset: start,
                    reason: format!("expected {expected} bytes, proxy sent {}", body.len()),
                });
            }
        } else {
            tracing::debug!(status = head.status, reason = %head.reason, "Chunk request failed");
        }

        Ok(ChunkResponse {
            status: head.status,
            body,
        })
    }

    async fn upload_prepare(&mut self, total_size: u64) -> Result<()> {
        if self.upload.is_some() {
            return Err(Error::Protocol("upload already started".to_string()));
        }

        let length = total_size.to_string();
        let request = if total_size == 0 {
            self.head("PUT", &[("Content-Length", length.as_str())])
        } else {
            let range = format!("bytes 0-{}/{total_size}", total_size - 1);
            self.head(
                "PUT",
                &[
                    ("Content-Range", range.as_str()),
                    ("Content-Length", length.as_str()),
                ],
            )
        };

        let stream = self.stream_at(0)?;
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| aborted(0, &e))?;

        self.upload = Some(UploadState {
            total: total_size,
            sent: 0,
        });
        Ok(())
    }

    async fn upload_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self
            .upload
            .ok_or_else(|| Error::Protocol("upload_chunk before upload_prepare".to_string()))?;

        let offset = state.sent;
        if offset + bytes.len() as u64 > state.total {
            return Err(Error::Protocol(format!(
                "upload body exceeds declared length {}",
                state.total
            )));
        }

        let stream = self.stream_at(offset)?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| aborted(offset, &e))?;

        state.sent += bytes.len() as u64;
        self.upload = Some(state);
        Ok(())
    }

    async fn upload_finish(&mut self) -> Result<ChunkResponse> {
        let state = self
            .upload
            .take()
            .ok_or_else(|| Error::Protocol("upload_finish before upload_prepare".to_string()))?;

        let stream = self.stream_at(state.sent)?;
        stream.flush().await.map_err(|e| aborted(state.sent, &e))?;

        let (head, body) = self.read_response(state.sent, None).await?;
        Ok(ChunkResponse {
            status: head.status,
            body,
        })
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Proxy connection shutdown: {e}");
            }
        }
        self.upload = None;
    }
}

fn aborted(offset: u64, e: &std::io::Error) -> Error {
    let reason = match e.kind() {
        std::io::ErrorKind::UnexpectedEof => "proxy closed the connection mid-chunk".to_string(),
        _ => e.to_string(),
    };
    Error::TransferAborted { offset, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    fn endpoint() -> ProxyEndpoint {
        ProxyEndpoint::parse("https://proxy.lab:54323/images/tkt-1").unwrap()
    }

    fn channel() -> (ProxyChannel<DuplexStream>, DuplexStream) {
        let (client, server) = duplex(1 << 20);
        let channel = ProxyChannel::new(client, &endpoint(), &SignedTicket::new("tkt-1"));
        (channel, server)
    }

    async fn read_request_head(server: &mut BufReader<DuplexStream>) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            let line = line.trim_end().to_string();
            if line.is_empty() {
                return lines;
            }
            lines.push(line);
        }
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = endpoint();
        assert_eq!(ep.host, "proxy.lab");
        assert_eq!(ep.port, 54323);
        assert_eq!(ep.path, "/images/tkt-1");
        assert!(ep.tls);
        assert_eq!(ep.host_header(), "proxy.lab:54323");

        let plain = ProxyEndpoint::parse("http://[::1]/images/x?fmt=raw").unwrap();
        assert_eq!(plain.host, "::1");
        assert_eq!(plain.port, 80);
        assert_eq!(plain.path, "/images/x?fmt=raw");
        assert_eq!(plain.host_header(), "[::1]");

        assert!(ProxyEndpoint::parse("ftp://proxy/images").is_err());
    }

    #[tokio::test]
    async fn test_download_chunk_sends_range_and_ticket() {
        let (mut channel, server) = channel();

        let server = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let head = read_request_head(&mut server).await;
            server
                .get_mut()
                .write_all(b"HTTP/1.1 206 Partial Content\r\nContent-Length: 4\r\n\r\nABCD")
                .await
                .unwrap();
            head
        });

        let response = channel.download_chunk(10, 13).await.unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(response.body, b"ABCD");

        let head = server.await.unwrap();
        assert_eq!(head[0], "GET /images/tkt-1 HTTP/1.1");
        assert!(head.contains(&"Host: proxy.lab:54323".to_string()));
        assert!(head.contains(&"Authorization: Bearer tkt-1".to_string()));
        assert!(head.contains(&"Range: bytes=10-13".to_string()));
    }

    #[tokio::test]
    async fn test_download_error_status_is_returned() {
        let (mut channel, server) = channel();

        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            read_request_head(&mut server).await;
            server
                .get_mut()
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 7\r\n\r\nexpired")
                .await
                .unwrap();
        });

        let response = channel.download_chunk(0, 99).await.unwrap();
        assert_eq!(response.status, 403);
        assert!(!response.is_success());
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_download_disconnect_mid_body_aborts() {
        let (mut channel, server) = channel();

        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            read_request_head(&mut server).await;
            server
                .get_mut()
                .write_all(b"HTTP/1.1 206 Partial Content\r\nContent-Length: 100\r\n\r\nshort")
                .await
                .unwrap();
            drop(server);
        });

        let err = channel.download_chunk(200, 299).await.unwrap_err();
        assert!(matches!(err, Error::TransferAborted { offset: 200, .. }));
    }

    #[tokio::test]
    async fn test_download_length_mismatch_aborts_before_reading() {
        let (mut channel, server) = channel();

        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            read_request_head(&mut server).await;
            server
                .get_mut()
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 17592186044416\r\n\r\n")
                .await
                .unwrap();
        });

        let err = channel.download_chunk(0, 9).await.unwrap_err();
        assert!(matches!(
            err,
            Error::TransferAborted { offset: 0, ref reason } if reason.contains("17592186044416")
        ));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_oversized_error_body_is_discarded() {
        let (mut channel, server) = channel();

        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            read_request_head(&mut server).await;
            server
                .get_mut()
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 1099511627776\r\n\r\n")
                .await
                .unwrap();
        });

        let response = channel.download_chunk(0, 9).await.unwrap();
        assert_eq!(response.status, 500);
        assert!(response.body.is_empty());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_upload_finish_rejects_oversized_reply() {
        let (mut channel, server) = channel();

        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            read_request_head(&mut server).await;
            let mut body = [0u8; 4];
            server.read_exact(&mut body).await.unwrap();
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                MAX_REPLY_BODY + 1
            );
            server.get_mut().write_all(reply.as_bytes()).await.unwrap();
        });

        channel.upload_prepare(4).await.unwrap();
        channel.upload_chunk(b"abcd").await.unwrap();
        let err = channel.upload_finish().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_upload_streams_one_request() {
        let (mut channel, server) = channel();

        let server = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let head = read_request_head(&mut server).await;
            let mut body = vec![0u8; 10];
            server.read_exact(&mut body).await.unwrap();
            server
                .get_mut()
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            (head, body)
        });

        channel.upload_prepare(10).await.unwrap();
        channel.upload_chunk(b"01234").await.unwrap();
        channel.upload_chunk(b"56789").await.unwrap();
        let response = channel.upload_finish().await.unwrap();
        assert_eq!(response.status, 200);

        let (head, body) = server.await.unwrap();
        assert_eq!(head[0], "PUT /images/tkt-1 HTTP/1.1");
        assert!(head.contains(&"Content-Range: bytes 0-9/10".to_string()));
        assert!(head.contains(&"Content-Length: 10".to_string()));
        assert_eq!(body, b"0123456789");
    }

    #[tokio::test]
    async fn test_upload_rejects_overrun() {
        let (mut channel, _server) = channel();
        channel.upload_prepare(4).await.unwrap();
        assert!(channel.upload_chunk(b"12345").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_fails_next_chunk() {
        let (mut channel, _server) = channel();
        channel.close().await;
        assert!(!channel.is_open());

        let err = channel.download_chunk(0, 9).await.unwrap_err();
        assert!(matches!(err, Error::TransferAborted { offset: 0, .. }));
    }
}
