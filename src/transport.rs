use async_trait::async_trait;

use crate::error::DeliveryError;

/// Performs a single outbound webhook request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` (JSON) to `target`. One attempt, no retries.
    async fn deliver(&self, target: &str, body: Vec<u8>) -> Result<(), DeliveryError>;
}

/// HTTP delivery over `reqwest`.
///
/// No signature or authentication headers are sent, and no timeout is set
/// beyond the client's own defaults.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, target: &str, body: Vec<u8>) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(target)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(DeliveryError::Status(resp.status().as_u16())),
            Err(err) if err.is_timeout() => Err(DeliveryError::Timeout),
            Err(err) => match err.status() {
                Some(status) => Err(DeliveryError::Status(status.as_u16())),
                None => Err(DeliveryError::Network(err.to_string())),
            },
        }
    }
}
