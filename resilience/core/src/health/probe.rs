//! Synthetic health probes
//!
//! A probe answers "is this provider reachable right now?" for the
//! background health-check schedule. Probe outcomes are recorded exactly
//! like real request outcomes.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::FailureReason;

/// Errors a health probe can report
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe has no way to check this provider; nothing is recorded
    #[error("no health probe configured for provider {0}")]
    Unsupported(String),

    /// The health endpoint answered with a non-success status
    #[error("health endpoint returned HTTP {status}")]
    Status { status: u16 },

    /// The request never produced a response
    #[error("health request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProbeError {
    /// Failure reason recorded against the provider
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Status { status: 429 } => FailureReason::RateLimit,
            Self::Status { status } if *status >= 500 => FailureReason::ServerError,
            Self::Status { .. } | Self::Unsupported(_) => FailureReason::ProviderUnavailable,
            Self::Transport(e) if e.is_timeout() => FailureReason::Timeout,
            Self::Transport(_) => FailureReason::NetworkError,
        }
    }
}

/// Checks a single provider
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, provider: &str) -> Result<(), ProbeError>;
}

/// Probe that issues `GET` against a per-provider health URL
///
/// Any 2xx response counts as healthy. Providers without a configured URL
/// are reported as [`ProbeError::Unsupported`].
#[derive(Clone, Debug)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
}

impl HttpHealthProbe {
    pub fn new<I, K, V>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::with_client(reqwest::Client::new(), endpoints)
    }

    /// Use a preconfigured client (proxies, TLS roots, default headers)
    pub fn with_client<I, K, V>(client: reqwest::Client, endpoints: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn endpoint(&self, provider: &str) -> Option<&str> {
        self.endpoints.get(provider).map(String::as_str)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, provider: &str) -> Result<(), ProbeError> {
        let url = self
            .endpoints
            .get(provider)
            .ok_or_else(|| ProbeError::Unsupported(provider.to_string()))?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status {
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response per connection
    async fn serve(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{addr}/health")
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_unsupported() {
        let probe = HttpHealthProbe::new([("openai", "http://127.0.0.1:9/health")]);
        let err = probe.probe("anthropic").await.unwrap_err();
        assert!(matches!(err, ProbeError::Unsupported(ref p) if p == "anthropic"));
        assert_eq!(probe.endpoint("openai"), Some("http://127.0.0.1:9/health"));
    }

    #[tokio::test]
    async fn test_success_status_is_healthy() {
        let url = serve("200 OK").await;
        let probe = HttpHealthProbe::new([("local", url)]);
        assert!(probe.probe("local").await.is_ok());
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let url = serve("503 Service Unavailable").await;
        let probe = HttpHealthProbe::new([("local", url)]);
        let err = probe.probe("local").await.unwrap_err();
        assert!(matches!(err, ProbeError::Status { status: 503 }));
        assert_eq!(err.reason(), FailureReason::ServerError);
    }

    #[test]
    fn test_status_reasons() {
        assert_eq!(
            ProbeError::Status { status: 429 }.reason(),
            FailureReason::RateLimit
        );
        assert_eq!(
            ProbeError::Status { status: 404 }.reason(),
            FailureReason::ProviderUnavailable
        );
    }
}
