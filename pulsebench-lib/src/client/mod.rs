//! Protocol clients.
//!
//! Every transport implements the same contract: execute one request, report
//! status, wall-clock duration and byte counts. Transport failures never
//! surface as `Err`; they come back as a response with status 0 and an error
//! kind so the pool treats them uniformly.

mod grpc;
mod http;

pub use self::{grpc::GrpcClient, http::HttpClient};

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use rama::{bytes::Bytes, error::OpaqueError};

use crate::config::{Target, Transport, WorkerConfig};

/// Transport-agnostic request.
#[derive(Debug, Clone)]
pub struct ProtocolRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub timeout: Duration,
}

impl ProtocolRequest {
    pub fn from_target(target: &Target) -> Self {
        Self {
            url: target.url.clone(),
            method: target.method.clone(),
            headers: target.headers.clone(),
            body: Bytes::from(target.body.clone().into_bytes()),
            timeout: target.timeout,
        }
    }
}

/// Why a request produced no usable status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Canceled,
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Transport => "transport_error",
        })
    }
}

/// Outcome of one request. Status 0 means the request never produced an HTTP
/// status (connect failure, timeout, cancellation).
#[derive(Debug, Clone)]
pub struct ProtocolResponse {
    pub status: u16,
    pub duration: Duration,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub error: Option<ErrorKind>,
}

impl ProtocolResponse {
    pub fn failure(kind: ErrorKind, duration: Duration) -> Self {
        Self {
            status: 0,
            duration,
            bytes_read: 0,
            bytes_written: 0,
            error: Some(kind),
        }
    }

    /// Error under the sink's classification: transport failure or HTTP >= 400.
    pub fn is_error(&self) -> bool {
        self.status == 0 || self.status >= 400
    }
}

#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    async fn execute(&self, req: &ProtocolRequest) -> ProtocolResponse;

    /// Releases pooled connections. Default is a no-op.
    async fn close(&self) {}
}

/// Connection behavior shared by all clients.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub tls_insecure: bool,
    pub idle_timeout: Duration,
    pub max_idle_conns: usize,
}

impl From<&WorkerConfig> for ClientSettings {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            tls_insecure: cfg.tls_insecure,
            idle_timeout: cfg.idle_timeout,
            max_idle_conns: cfg.max_idle_conns,
        }
    }
}

/// One pooled client per transport, shared across workers and the health
/// checker.
pub struct ClientSet {
    http: Arc<dyn ProtocolClient>,
    http2: Arc<dyn ProtocolClient>,
    grpc: Arc<dyn ProtocolClient>,
}

impl ClientSet {
    pub fn new(settings: ClientSettings) -> Result<Self, OpaqueError> {
        Ok(Self {
            http: Arc::new(HttpClient::new_http1(&settings)?),
            http2: Arc::new(HttpClient::new_http2(&settings)?),
            grpc: Arc::new(GrpcClient::new(settings)),
        })
    }

    pub fn for_transport(&self, transport: Transport) -> Arc<dyn ProtocolClient> {
        match transport {
            Transport::Http => self.http.clone(),
            Transport::Http2 => self.http2.clone(),
            Transport::Grpc => self.grpc.clone(),
        }
    }

    pub async fn close(&self) {
        self.http.close().await;
        self.http2.close().await;
        self.grpc.close().await;
    }

    /// Test seam: one client serves every transport.
    #[cfg(test)]
    pub(crate) fn single_for_tests(client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            http: client.clone(),
            http2: client.clone(),
            grpc: client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_from_target_copies_everything() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Trace".to_string(), "abc".to_string());
        let target = Target {
            name: "t".into(),
            url: "http://localhost:1234/x".into(),
            transport: Transport::Http,
            method: "POST".into(),
            headers,
            body: "payload".into(),
            weight: 1,
            timeout: Duration::from_secs(3),
        };

        let req = ProtocolRequest::from_target(&target);
        assert_eq!(req.url, target.url);
        assert_eq!(req.method, "POST");
        assert_eq!(req.headers.get("X-Trace").map(String::as_str), Some("abc"));
        assert_eq!(&req.body[..], b"payload");
        assert_eq!(req.timeout, Duration::from_secs(3));
    }

    #[test]
    fn failure_responses_classify_as_errors() {
        let resp = ProtocolResponse::failure(ErrorKind::Timeout, Duration::from_millis(5));
        assert_eq!(resp.status, 0);
        assert!(resp.is_error());

        let redirect = ProtocolResponse {
            status: 302,
            duration: Duration::from_millis(1),
            bytes_read: 0,
            bytes_written: 0,
            error: None,
        };
        assert!(!redirect.is_error());
    }
}
