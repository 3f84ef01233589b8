use crate::webhooks::RenderedRequest;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use std::time::Duration;
use tokio::time::timeout;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("notification to {0} timed out")]
    Timeout(String),
    #[error("notification to {0} failed: {1}")]
    RequestFailed(String, String),
    #[error("invalid notification request: {0}")]
    InvalidRequest(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends rendered notifications. Implementations must bound every send in time.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, request: &RenderedRequest) -> Result<TransportResponse, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl NotificationTransport for HttpTransport {
    async fn send(&self, request: &RenderedRequest) -> Result<TransportResponse, TransportError> {
        let target = request
            .url
            .host_str()
            .unwrap_or(request.url.as_str())
            .to_string();

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let built = builder
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        // The timeout covers the response body as well.
        let exchange = async {
            let response = self.client.execute(built).await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(TransportResponse {
                status,
                headers,
                body,
            })
        };

        timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(target.clone()))?
            .map_err(|e| TransportError::RequestFailed(target, e.to_string()))
    }
}
