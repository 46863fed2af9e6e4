// CopperEgg REST endpoint: a reqwest client bound to one API host with
// basic-auth credentials.
//
// Every call resolves to an `ApiResponse` regardless of HTTP status; callers
// decide which statuses count as failures. Only transport problems surface as
// `ClientError`.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid endpoint url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Status and raw body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}

pub struct Endpoint {
    http: reqwest::Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl Endpoint {
    /// Build an endpoint for `base_url`. Only the scheme, host and port of the
    /// base are kept; request paths are always absolute.
    pub fn new(
        base_url: &str,
        username: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let base = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(ClientError::Build)?;
        Ok(Self {
            http,
            base,
            username: username.filter(|u| !u.is_empty()),
            password,
        })
    }

    /// Resolve an absolute request path (optionally with a query string).
    pub fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base.join(path).map_err(|e| ClientError::InvalidUrl {
            url: format!("{}{}", self.base, path),
            message: e.to_string(),
        })
    }

    /// Resolve `collection` and append `item` as one escaped path segment.
    ///
    /// `/`, `?`, `#` and `%` inside `item` are percent-encoded, so an id can
    /// never leave the collection it names.
    pub fn item_url(&self, collection: &str, item: &str) -> Result<Url, ClientError> {
        let mut url = self.url(collection)?;
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidUrl {
                url: self.base.to_string(),
                message: "base url cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .push(item);
        Ok(url)
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ClientError> {
        let url = self.url(path)?;
        debug!(%url, "GET");
        self.send(&url, self.http.get(url.clone())).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<ApiResponse, ClientError> {
        let url = self.url(path)?;
        debug!(%url, "POST");
        let request = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string());
        self.send(&url, request).await
    }

    /// DELETE `collection/<item>`.
    pub async fn delete_item(
        &self,
        collection: &str,
        item: &str,
    ) -> Result<ApiResponse, ClientError> {
        let url = self.item_url(collection, item)?;
        debug!(%url, "DELETE");
        self.send(&url, self.http.delete(url.clone())).await
    }

    async fn send(&self, url: &Url, request: RequestBuilder) -> Result<ApiResponse, ClientError> {
        let request = match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        };
        let transport = |source: reqwest::Error| ClientError::Transport {
            url: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        debug!(%url, status, "response received");
        Ok(ApiResponse { status, body })
    }
}
