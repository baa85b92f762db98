use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use rama::error::{ErrorContext as _, OpaqueError};
use tokio::{sync::Mutex, time::Instant};
use tonic::{Code, transport::Channel, transport::Endpoint};
use tonic_health::pb::{
    HealthCheckRequest, health_check_response::ServingStatus, health_client::HealthClient,
};

use super::{ClientSettings, ErrorKind, ProtocolClient, ProtocolRequest, ProtocolResponse};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// gRPC client. The request URL is treated as an authority against which the
/// standard health-check call (empty service name) is issued. One channel is
/// kept per authority, with HTTP/2 keepalive.
pub struct GrpcClient {
    settings: ClientSettings,
    channels: Mutex<HashMap<String, Channel>>,
}

impl GrpcClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn channel_for(&self, authority: &str) -> Result<Channel, OpaqueError> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(authority) {
            return Ok(channel.clone());
        }

        let uri = if authority.contains("://") {
            authority.to_string()
        } else {
            format!("http://{authority}")
        };

        let endpoint = Endpoint::from_shared(uri)
            .context("parse grpc authority")?
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true)
            .tcp_keepalive(Some(self.settings.idle_timeout));

        let channel = endpoint.connect_lazy();
        channels.insert(authority.to_string(), channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl ProtocolClient for GrpcClient {
    async fn execute(&self, req: &ProtocolRequest) -> ProtocolResponse {
        let start = Instant::now();

        let channel = match self.channel_for(&req.url).await {
            Ok(channel) => channel,
            Err(err) => {
                tracing::debug!(authority = %req.url, "grpc channel setup failed: {err}");
                return ProtocolResponse::failure(ErrorKind::Transport, start.elapsed());
            }
        };

        let mut client = HealthClient::new(channel);
        let check = client.check(HealthCheckRequest {
            service: String::new(),
        });

        let outcome = match tokio::time::timeout(req.timeout, check).await {
            Err(_) => return ProtocolResponse::failure(ErrorKind::Timeout, start.elapsed()),
            Ok(outcome) => outcome,
        };

        match outcome {
            Ok(response) => {
                // SERVING maps to a 200-equivalent; any other serving status
                // is reported as unavailable so it classifies as an error.
                let status = if response.into_inner().status == ServingStatus::Serving as i32 {
                    200
                } else {
                    503
                };
                ProtocolResponse {
                    status,
                    duration: start.elapsed(),
                    bytes_read: 0,
                    bytes_written: 0,
                    error: None,
                }
            }
            Err(status) => {
                tracing::debug!(authority = %req.url, "grpc health check failed: {status}");
                let kind = match status.code() {
                    Code::DeadlineExceeded => ErrorKind::Timeout,
                    Code::Cancelled => ErrorKind::Canceled,
                    _ => ErrorKind::Transport,
                };
                ProtocolResponse::failure(kind, start.elapsed())
            }
        }
    }

    async fn close(&self) {
        self.channels.lock().await.clear();
    }
}
