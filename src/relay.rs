//! Range-aware upstream byte-stream relay.
//!
//! Fetches a resolved stream URL with a browser-like `User-Agent`/`Referer`
//! pair, forwards the caller's `Range` header only when one was sent, and
//! streams the upstream body back without buffering it. Upstream frames
//! larger than the chunk size are split; smaller frames are forwarded as
//! soon as they arrive.
//!
//! Dropping the response body (client disconnect) drops the upstream
//! stream, which releases the upstream connection.

use crate::error::RelayError;
use crate::metrics;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::{StreamExt, stream};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Standard relay chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default bound on connecting and receiving the upstream response head.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

pub const DEFAULT_REFERER: &str = "https://www.youtube.com/";

/// Content type used when upstream does not send one
pub const FALLBACK_CONTENT_TYPE: &str = "audio/mp4";

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub user_agent: String,
    pub referer: String,
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    /// Relay upstream's 200 as 200 when it ignored a requested range
    pub passthrough_status: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: DEFAULT_REFERER.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            passthrough_status: false,
        }
    }
}

/// Status, headers and a streaming body ready to hand to the client
#[derive(Debug)]
pub struct StreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl IntoResponse for StreamResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

#[derive(Debug, Clone)]
pub struct StreamRelay {
    client: Client,
    settings: Arc<RelaySettings>,
}

impl StreamRelay {
    pub fn new(client: Client, settings: RelaySettings) -> Self {
        Self {
            client,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Open `stream_url` upstream and relay it.
    ///
    /// The status is 206 when `range` is present and 200 otherwise; with
    /// `passthrough_status` set, an upstream 200 answer to a ranged request
    /// is relayed as 200. An upstream 416 is a bad client range, not an
    /// upstream failure, and is relayed as 416 with an empty body.
    ///
    /// # Errors
    ///
    /// [`RelayError::UpstreamFetchFailed`] if upstream cannot be reached,
    /// does not answer within the connect timeout, or answers any other
    /// non-2xx status. Once
    /// the response head has been returned, later upstream failures only
    /// truncate the body.
    pub async fn relay(
        &self,
        stream_url: &str,
        range: Option<&HeaderValue>,
    ) -> Result<StreamResponse, RelayError> {
        let start = Instant::now();
        debug!("Relaying {} (range: {:?})", stream_url, range);

        let mut request = self
            .client
            .get(stream_url)
            .header(header::USER_AGENT, &self.settings.user_agent)
            .header(header::REFERER, &self.settings.referer);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.clone());
        }

        let upstream = match tokio::time::timeout(self.settings.connect_timeout, request.send()).await
        {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(upstream_failed(format!("upstream request failed: {e}"))),
            Err(_) => {
                return Err(upstream_failed(format!(
                    "upstream did not respond within {}s",
                    self.settings.connect_timeout.as_secs()
                )));
            }
        };

        let upstream_status = upstream.status();
        if upstream_status == StatusCode::RANGE_NOT_SATISFIABLE {
            info!("Upstream rejected range {:?} for {}", range, stream_url);
            return Ok(range_not_satisfiable(upstream.headers()));
        }
        if !upstream_status.is_success() {
            return Err(upstream_failed(format!(
                "upstream answered {upstream_status}"
            )));
        }

        let status = match range {
            Some(_) if self.settings.passthrough_status && upstream_status == StatusCode::OK => {
                StatusCode::OK
            }
            Some(_) => StatusCode::PARTIAL_CONTENT,
            None => StatusCode::OK,
        };

        let headers = response_headers(upstream.headers());
        info!(
            "Upstream answered {} in {}ms, relaying as {}",
            upstream_status,
            start.elapsed().as_millis(),
            status
        );

        let chunk_size = self.settings.chunk_size.max(1);
        let body = upstream
            .bytes_stream()
            .map(move |frame| match frame {
                Ok(bytes) => {
                    metrics::record_relay_bytes(bytes.len());
                    stream::iter(split_chunks(bytes, chunk_size).into_iter().map(Ok).collect::<Vec<_>>())
                }
                Err(e) => {
                    warn!("Upstream stream ended early: {}", e);
                    metrics::record_upstream_error();
                    stream::iter(vec![Err(e)])
                }
            })
            .flatten();

        Ok(StreamResponse {
            status,
            headers,
            body: Body::from_stream(body),
        })
    }
}

fn upstream_failed(detail: String) -> RelayError {
    metrics::record_upstream_error();
    RelayError::UpstreamFetchFailed(detail)
}

/// 416 carrying upstream's `Content-Range: bytes */<size>` when it sent one
fn range_not_satisfiable(upstream: &HeaderMap) -> StreamResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = upstream.get(header::CONTENT_RANGE) {
        headers.insert(header::CONTENT_RANGE, value.clone());
    }
    StreamResponse {
        status: StatusCode::RANGE_NOT_SATISFIABLE,
        headers,
        body: Body::empty(),
    }
}

/// Headers surfaced to the client.
fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_TYPE,
        upstream
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(FALLBACK_CONTENT_TYPE)),
    );
    for name in [header::CONTENT_LENGTH, header::CONTENT_RANGE] {
        if let Some(value) = upstream.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}

/// Split `bytes` into pieces of at most `max` bytes without copying.
pub fn split_chunks(mut bytes: Bytes, max: usize) -> Vec<Bytes> {
    let max = max.max(1);
    let mut chunks = Vec::with_capacity(bytes.len().div_ceil(max));
    while bytes.len() > max {
        chunks.push(bytes.split_to(max));
    }
    if !bytes.is_empty() {
        chunks.push(bytes);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::{header as has_header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay_with(settings: RelaySettings) -> StreamRelay {
        StreamRelay::new(Client::new(), settings)
    }

    fn relay() -> StreamRelay {
        relay_with(RelaySettings::default())
    }

    async fn body_bytes(resp: StreamResponse) -> Vec<u8> {
        resp.body.collect().await.unwrap().to_bytes().to_vec()
    }

    #[test]
    fn split_chunks_caps_size() {
        let chunks = split_chunks(Bytes::from(vec![7u8; 10]), 4);
        let sizes: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        assert_eq!(split_chunks(Bytes::from_static(b"abc"), 64).len(), 1);
        assert!(split_chunks(Bytes::new(), 64).is_empty());
    }

    #[tokio::test]
    async fn range_is_forwarded_and_answered_206() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.m4a"))
            .and(has_header("range", "bytes=100-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 100-104/105")
                    .set_body_bytes(b"hello".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let range = HeaderValue::from_static("bytes=100-");
        let resp = relay()
            .relay(&format!("{}/a.m4a", server.uri()), Some(&range))
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(resp.headers[header::CONTENT_RANGE], "bytes 100-104/105");
        assert_eq!(resp.headers[header::CONTENT_TYPE], FALLBACK_CONTENT_TYPE);
        assert_eq!(body_bytes(resp).await, b"hello");
    }

    #[tokio::test]
    async fn no_range_is_200_and_sends_none_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"full".to_vec(), "audio/webm"))
            .mount(&server)
            .await;

        let resp = relay().relay(&server.uri(), None).await.unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers[header::CONTENT_TYPE], "audio/webm");
        assert_eq!(resp.headers[header::CONTENT_LENGTH], "4");
        assert!(resp.headers.get(header::CONTENT_RANGE).is_none());
        assert_eq!(body_bytes(resp).await, b"full");

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(!received[0].headers.contains_key("range"));
    }

    #[tokio::test]
    async fn browser_headers_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(has_header("user-agent", "test-agent/1.0"))
            .and(has_header("referer", "https://ref.example.com/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let resp = relay_with(RelaySettings {
            user_agent: "test-agent/1.0".into(),
            referer: "https://ref.example.com/".into(),
            ..RelaySettings::default()
        })
        .relay(&server.uri(), None)
        .await
        .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn status_follows_intent_unless_passthrough() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"whole".to_vec()))
            .mount(&server)
            .await;
        let range = HeaderValue::from_static("bytes=0-");

        let intent = relay().relay(&server.uri(), Some(&range)).await.unwrap();
        assert_eq!(intent.status, StatusCode::PARTIAL_CONTENT);

        let passthrough = relay_with(RelaySettings {
            passthrough_status: true,
            ..RelaySettings::default()
        })
        .relay(&server.uri(), Some(&range))
        .await
        .unwrap();
        assert_eq!(passthrough.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn upstream_error_status_is_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = relay().relay(&server.uri(), None).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamFetchFailed(_)));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_relayed_as_416() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(has_header("range", "bytes=500-"))
            .respond_with(
                ResponseTemplate::new(416)
                    .insert_header("content-range", "bytes */20")
                    .set_body_string("out of range"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let range = HeaderValue::from_static("bytes=500-");
        let resp = relay().relay(&server.uri(), Some(&range)).await.unwrap();

        assert_eq!(resp.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers[header::CONTENT_RANGE], "bytes */20");
        assert!(body_bytes(resp).await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_fetch_failure() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = relay()
            .relay(&format!("http://{addr}/a.m4a"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UpstreamFetchFailed(_)));
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let err = relay_with(RelaySettings {
            connect_timeout: Duration::from_millis(100),
            ..RelaySettings::default()
        })
        .relay(&format!("http://{addr}/a.m4a"), None)
        .await
        .unwrap_err();
        assert!(err.to_string().contains("did not respond"));
    }

    #[tokio::test]
    async fn first_chunk_arrives_before_upstream_eof() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: audio/mp4\r\nContent-Length: 10000000\r\n\r\nfirst-bytes",
                )
                .await
                .unwrap();
            socket.flush().await.unwrap();
            // Withhold the rest of the body
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let resp = relay()
            .relay(&format!("http://{addr}/live.m4a"), None)
            .await
            .unwrap();
        assert_eq!(resp.headers[header::CONTENT_LENGTH], "10000000");

        let mut body = resp.body;
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("first chunk held back until EOF")
            .unwrap()
            .unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"first-bytes"));
    }

    #[tokio::test]
    async fn large_frames_are_split_to_chunk_size() {
        let server = MockServer::start().await;
        let payload = vec![1u8; 300 * 1024];
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .mount(&server)
            .await;

        let resp = relay().relay(&server.uri(), None).await.unwrap();
        let mut body = resp.body;
        let mut total = 0;
        while let Some(frame) = body.frame().await {
            let data = frame.unwrap().into_data().unwrap();
            assert!(data.len() <= DEFAULT_CHUNK_SIZE);
            total += data.len();
        }
        assert_eq!(total, payload.len());
    }

    #[tokio::test]
    async fn upstream_close_mid_body_truncates_with_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial-body")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            // Socket dropped with 988 bytes still owed
        });

        let resp = relay()
            .relay(&format!("http://{addr}/a.m4a"), None)
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);

        let mut body = resp.body;
        let mut received = Vec::new();
        let mut failed = false;
        while let Some(frame) = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("body stalled after upstream closed")
        {
            match frame {
                Ok(frame) => received.extend_from_slice(&frame.into_data().unwrap()),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }

        assert_eq!(received, b"partial-body");
        assert!(failed, "truncated body ended cleanly");
    }

    #[tokio::test]
    async fn dropping_body_releases_upstream_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10000000\r\n\r\nfirst-bytes")
                .await
                .unwrap();
            socket.flush().await.unwrap();

            // The client never sends anything else; only EOF or a reset ends this read
            let outcome = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf)).await;
            let _ = closed_tx.send(matches!(outcome, Ok(Ok(0)) | Ok(Err(_))));
        });

        let resp = relay()
            .relay(&format!("http://{addr}/a.m4a"), None)
            .await
            .unwrap();
        let mut body = resp.body;
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"first-bytes"));

        drop(body);

        let closed = tokio::time::timeout(Duration::from_secs(6), closed_rx)
            .await
            .expect("upstream never saw the connection close")
            .unwrap();
        assert!(closed, "upstream connection still open after body was dropped");
    }
}
