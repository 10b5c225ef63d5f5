//! HTTP health endpoints.
//!
//! A unit may declare a `healthUrl`. Once the cluster reports its objects
//! ready, the verifier also requires that URL to answer with a 2xx or 3xx
//! status. Any other answer, or no answer, keeps the unit progressing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::cluster::UnitHealth;

/// Checks an HTTP endpoint.
#[async_trait]
pub trait EndpointCheck: Send + Sync {
    async fn check(&self, url: &str) -> UnitHealth;
}

/// [`EndpointCheck`] issuing a plain GET.
pub struct HttpEndpointCheck {
    client: Client,
}

impl HttpEndpointCheck {
    /// Check with a per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

impl Default for HttpEndpointCheck {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl EndpointCheck for HttpEndpointCheck {
    async fn check(&self, url: &str) -> UnitHealth {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(%url, %status, "Health endpoint answered");
                if status.is_success() || status.is_redirection() {
                    UnitHealth::Ready
                } else {
                    UnitHealth::Progressing(format!("GET {url} returned {status}"))
                }
            }
            Err(e) => UnitHealth::Progressing(format!("GET {url} failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_success_is_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let health = HttpEndpointCheck::default()
            .check(&format!("{}/healthz", server.uri()))
            .await;
        assert_eq!(health, UnitHealth::Ready);
    }

    #[tokio::test]
    async fn test_error_status_keeps_progressing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = format!("{}/healthz", server.uri());
        let health = HttpEndpointCheck::default().check(&url).await;
        assert_eq!(
            health,
            UnitHealth::Progressing(format!("GET {url} returned 503 Service Unavailable"))
        );
    }

    #[tokio::test]
    async fn test_unreachable_keeps_progressing() {
        let server = MockServer::start().await;
        let url = format!("{}/healthz", server.uri());
        drop(server);

        let health = HttpEndpointCheck::new(Duration::from_secs(2)).check(&url).await;
        assert!(matches!(health, UnitHealth::Progressing(reason) if reason.contains("failed")));
    }
}
