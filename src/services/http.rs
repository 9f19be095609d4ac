use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::models::SessionId;

pub const SESSION_HEADER: &str = "X-Session-Id";

#[derive(Debug, Error)]
pub enum HttpCallError {
    #[error("invalid base url {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("resource not found")]
    NotFound,
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for HttpCallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            HttpCallError::Decode(e.to_string())
        } else {
            HttpCallError::Transport(e.to_string())
        }
    }
}

/// JSON over HTTP against one dependency's base url.
#[derive(Debug, Clone)]
pub struct JsonHttpClient {
    client: reqwest::Client,
    base_url: Url,
}

impl JsonHttpClient {
    /// `timeout` is a transport-level ceiling; the command executor applies its own.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HttpCallError> {
        let mut base_url =
            Url::parse(base_url).map_err(|_| HttpCallError::InvalidUrl(base_url.to_string()))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, HttpCallError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|_| HttpCallError::InvalidUrl(path.to_string()))
    }

    #[instrument(skip(self, query), fields(base_url = %self.base_url))]
    pub async fn get_json<T, Q>(
        &self,
        path: &str,
        query: &Q,
        session_id: SessionId,
    ) -> Result<T, HttpCallError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let response = self
            .client
            .get(self.url(path)?)
            .query(query)
            .header(SESSION_HEADER, session_id.to_string())
            .send()
            .await?;
        Self::read(response).await
    }

    #[instrument(skip(self, body), fields(base_url = %self.base_url))]
    pub async fn post_json<T, B>(
        &self,
        path: &str,
        body: &B,
        session_id: SessionId,
    ) -> Result<T, HttpCallError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self
            .client
            .post(self.url(path)?)
            .json(body)
            .header(SESSION_HEADER, session_id.to_string())
            .send()
            .await?;
        Self::read(response).await
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, HttpCallError> {
        let status = response.status();
        debug!(status = status.as_u16(), "dependency responded");
        if status == StatusCode::NOT_FOUND {
            return Err(HttpCallError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpCallError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}
