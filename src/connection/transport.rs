//! HTTP transport seam for the receive side.
//!
//! The actual HTTP client (and everything in front of it: TLS, auth, proxy)
//! belongs to the caller; the connection manager only needs a way to open a
//! request with headers and read the response body incrementally. The
//! in-memory [`MockTransport`] scripts connection outcomes for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::error::ConnectionError;

/// Header requesting an event stream.
pub const ACCEPT_HEADER: (&str, &str) = ("Accept", "text/event-stream");

/// Header replaying the last observed event id on reconnect.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// An outgoing stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseRequest {
    /// Endpoint URL.
    pub url: String,
    /// Request headers, in insertion order.
    pub headers: Vec<(String, String)>,
}

impl SseRequest {
    /// Build a request for the given URL with the `Accept` header set.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: vec![(ACCEPT_HEADER.0.to_owned(), ACCEPT_HEADER.1.to_owned())],
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The value of a header, if present (case-insensitive name match).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Incremental reader over a response body.
#[async_trait]
pub trait SseBody: Send {
    /// The next chunk of body bytes; `None` when the stream ends cleanly.
    async fn next_bytes(&mut self) -> Option<Result<Bytes, ConnectionError>>;
}

/// An opened stream response.
pub struct SseResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Streaming body reader.
    pub body: Box<dyn SseBody>,
}

impl std::fmt::Debug for SseResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"<SseBody>")
            .finish()
    }
}

/// Factory opening one streaming request per connection attempt.
#[async_trait]
pub trait SseTransport: Send + Sync {
    /// Issue the request and return the streaming response.
    async fn open(&self, request: SseRequest) -> Result<SseResponse, ConnectionError>;
}

/// One step of a scripted mock body.
#[derive(Debug, Clone)]
pub enum MockRead {
    /// Deliver these bytes.
    Data(Vec<u8>),
    /// Wait before the next read resolves (exercises heartbeat timeouts).
    Delay(Duration),
    /// Fail the read mid-stream.
    Error(String),
}

/// A scripted connection attempt outcome.
#[derive(Debug, Clone)]
pub enum MockConnection {
    /// The request fails outright.
    Refused(String),
    /// The request succeeds and the body plays these reads, then EOF.
    Stream(Vec<MockRead>),
}

struct MockBody {
    reads: VecDeque<MockRead>,
}

#[async_trait]
impl SseBody for MockBody {
    async fn next_bytes(&mut self) -> Option<Result<Bytes, ConnectionError>> {
        loop {
            match self.reads.pop_front()? {
                MockRead::Data(data) => return Some(Ok(Bytes::from(data))),
                MockRead::Delay(duration) => tokio::time::sleep(duration).await,
                MockRead::Error(message) => {
                    return Some(Err(ConnectionError::Read(message)))
                }
            }
        }
    }
}

/// Scripted in-memory transport for tests.
///
/// Connection attempts consume scripted outcomes in order; when the script
/// runs out, further attempts are refused. Every issued request is recorded
/// so tests can assert on headers such as `Last-Event-ID`.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockConnection>>,
    requests: Mutex<Vec<SseRequest>>,
}

impl MockTransport {
    /// Create a transport playing the given outcomes in order.
    pub fn new(script: impl IntoIterator<Item = MockConnection>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Requests issued so far.
    pub fn requests(&self) -> Vec<SseRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SseTransport for MockTransport {
    async fn open(&self, request: SseRequest) -> Result<SseResponse, ConnectionError> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request);
        let next = self
            .script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        match next {
            Some(MockConnection::Stream(reads)) => Ok(SseResponse {
                status: 200,
                headers: vec![("Content-Type".into(), "text/event-stream".into())],
                body: Box::new(MockBody {
                    reads: reads.into(),
                }),
            }),
            Some(MockConnection::Refused(message)) => Err(ConnectionError::Connect(message)),
            None => Err(ConnectionError::Connect("mock script exhausted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_accept_header() {
        let request = SseRequest::new("http://example/stream");
        assert_eq!(request.header("accept"), Some("text/event-stream"));
    }

    #[tokio::test]
    async fn mock_plays_script_in_order() {
        let transport = MockTransport::new([
            MockConnection::Refused("boom".into()),
            MockConnection::Stream(vec![MockRead::Data(b"data: x\n\n".to_vec())]),
        ]);

        let err = transport
            .open(SseRequest::new("http://example"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Connect(_)));

        let mut response = transport
            .open(SseRequest::new("http://example"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let bytes = response.body.next_bytes().await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"data: x\n\n");
        assert!(response.body.next_bytes().await.is_none());

        assert_eq!(transport.requests().len(), 2);
    }
}
