// Delivery of custom resource responses to the stack's presigned URL.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::CfnResponse;

#[derive(Debug, Error)]
pub enum CfnError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("failed to encode stack response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("stack response to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("stack response to {url} rejected with status {status}: {body}")]
    Rejected {
        url: String,
        status: u16,
        body: String,
    },
}

/// PUTs `CfnResponse` documents to presigned response URLs.
#[derive(Clone)]
pub struct StackResponder {
    http: reqwest::Client,
}

impl StackResponder {
    pub fn new(timeout: Duration) -> Result<Self, CfnError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(CfnError::Build)?;
        Ok(Self { http })
    }

    /// Send `response` to `response_url`.
    ///
    /// The presigned URL is signed without a content type, so the header is
    /// sent empty.
    pub async fn respond_to_stack(
        &self,
        response: &CfnResponse,
        response_url: &str,
    ) -> Result<(), CfnError> {
        let body = serde_json::to_vec(response)?;
        debug!(
            status = ?response.status,
            physical_resource_id = %response.physical_resource_id,
            "sending stack response"
        );

        let reply = self
            .http
            .put(response_url)
            .header(CONTENT_TYPE, "")
            .body(body)
            .send()
            .await
            .map_err(|source| CfnError::Transport {
                url: response_url.to_string(),
                source,
            })?;

        let status = reply.status();
        if !status.is_success() {
            let body = reply.text().await.unwrap_or_default();
            return Err(CfnError::Rejected {
                url: response_url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        info!(
            stack_id = %response.stack_id,
            request_id = %response.request_id,
            "stack response delivered"
        );
        Ok(())
    }
}
