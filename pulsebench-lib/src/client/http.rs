use std::sync::Arc;

use async_trait::async_trait;
use rama::{
    Service as _,
    error::{ErrorContext as _, OpaqueError},
    http::{Body, Request, Response, Version, body::util::BodyExt as _, client::EasyHttpWebClient},
    net::tls::client::ServerVerifyMode,
    service::BoxService,
    tls::boring::client::TlsConnectorDataBuilder,
};
use tokio::time::Instant;

use super::{ClientSettings, ErrorKind, ProtocolClient, ProtocolRequest, ProtocolResponse};

/// HTTP client for the HTTP/1.1 and HTTP/2 transports.
///
/// Redirects are not followed; 3xx responses are reported as-is. Response
/// bodies are drained only to count their bytes. Connections are pooled and
/// reused by the underlying connector stack.
pub struct HttpClient {
    inner: BoxService<Request, Response, OpaqueError>,
}

impl HttpClient {
    pub fn new_http1(settings: &ClientSettings) -> Result<Self, OpaqueError> {
        Ok(Self {
            inner: build_web_client(settings, Version::HTTP_11)?,
        })
    }

    pub fn new_http2(settings: &ClientSettings) -> Result<Self, OpaqueError> {
        Ok(Self {
            inner: build_web_client(settings, Version::HTTP_2)?,
        })
    }
}

fn build_web_client(
    settings: &ClientSettings,
    default_version: Version,
) -> Result<BoxService<Request, Response, OpaqueError>, OpaqueError> {
    let mut tls_config = TlsConnectorDataBuilder::new_http_auto();
    if settings.tls_insecure {
        tls_config = tls_config.with_server_verify_mode(ServerVerifyMode::Disable);
    }

    Ok(EasyHttpWebClient::connector_builder()
        .with_default_transport_connector()
        .without_tls_proxy_support()
        .without_proxy_support()
        // fallback version for plaintext connections where no ALPN happens
        .with_tls_support_using_boringssl_and_default_http_version(
            Some(Arc::new(tls_config)),
            default_version,
        )
        .with_default_http_connector()
        .try_with_default_connection_pool()
        .context("create connection pool for http client")?
        .build_client()
        .boxed())
}

fn build_request(req: &ProtocolRequest) -> Result<Request, OpaqueError> {
    let mut builder = Request::builder()
        .method(req.method.as_str())
        .uri(req.url.clone());
    for (name, value) in &req.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let body = if req.body.is_empty() {
        Body::empty()
    } else {
        Body::from(req.body.clone())
    };

    builder.body(body).context("build http request")
}

#[async_trait]
impl ProtocolClient for HttpClient {
    async fn execute(&self, req: &ProtocolRequest) -> ProtocolResponse {
        let start = Instant::now();

        let request = match build_request(req) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(url = %req.url, "invalid request: {err}");
                return ProtocolResponse::failure(ErrorKind::Transport, start.elapsed());
            }
        };
        let bytes_written = req.body.len() as u64;

        let response = match tokio::time::timeout(req.timeout, self.inner.serve(request)).await {
            Err(_) => return ProtocolResponse::failure(ErrorKind::Timeout, start.elapsed()),
            Ok(Err(err)) => {
                tracing::debug!(url = %req.url, "request failed: {err}");
                return ProtocolResponse::failure(ErrorKind::Transport, start.elapsed());
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        let bytes_read = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes().len() as u64,
            Err(err) => {
                tracing::debug!(url = %req.url, "drain response body failed: {err}");
                return ProtocolResponse::failure(ErrorKind::Transport, start.elapsed());
            }
        };

        ProtocolResponse {
            status,
            duration: start.elapsed(),
            bytes_read,
            bytes_written,
            error: None,
        }
    }
}
