//! Credential validation against the origin media server.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use url::Url;

use crate::config::OriginConfig;

/// Failures talking to the origin.
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    /// The origin URL could not be built.
    #[error("invalid origin url: {0}")]
    Url(#[from] url::ParseError),
    /// Network failure or timeout.
    #[error("origin request failed: {0}")]
    Request(#[source] reqwest::Error),
    /// The origin answered something other than 200 or 401.
    #[error("origin answered unexpected status {0}")]
    UnexpectedStatus(u16),
}

/// Decides whether a caller credential is accepted by the origin.
pub trait CredentialValidator: Send + Sync + 'static {
    /// `Ok(true)` for a valid credential, `Ok(false)` for a rejected one.
    fn validate(&self, credential: &str) -> impl Future<Output = Result<bool, OriginError>> + Send;
}

/// Validates credentials with one bounded `GET` against the origin.
#[derive(Debug, Clone)]
pub struct HttpCredentialValidator {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpCredentialValidator {
    /// Build a validator from the `[origin]` section.
    pub fn new(config: &OriginConfig) -> Result<Self, OriginError> {
        Self::with_timeout(&config.host, &config.validate_path, config.timeout)
    }

    /// Build a validator for `{host}{path}` with a per-request timeout.
    /// A path prefix on `host` is kept in front of `path`.
    pub fn with_timeout(host: &str, path: &str, timeout: Duration) -> Result<Self, OriginError> {
        let mut endpoint = Url::parse(host)?;
        let base = endpoint.path().trim_end_matches('/').to_string();
        let path = path.trim_start_matches('/');
        endpoint.set_path(&format!("{base}/{path}"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(OriginError::Request)?;
        Ok(Self { client, endpoint })
    }
}

impl CredentialValidator for HttpCredentialValidator {
    async fn validate(&self, credential: &str) -> Result<bool, OriginError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("api_key", credential);

        // the request url carries the credential
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| OriginError::Request(e.without_url()))?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::UNAUTHORIZED => Ok(false),
            other => Err(OriginError::UnexpectedStatus(other.as_u16())),
        }
    }
}
