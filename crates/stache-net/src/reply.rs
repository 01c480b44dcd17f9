//! Posting replies, with or without an attached image.

use crate::oauth::OAuthCredentials;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const UPDATE_URL: &str = "https://api.twitter.com/1.1/statuses/update.json";
pub const UPLOAD_URL: &str = "https://upload.twitter.com/1.1/media/upload.json";

#[derive(Error, Debug)]
pub enum ReplyError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<ReplyError> },
}

impl ReplyError {
    /// Transport failures and server-side errors are worth another try.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 10, delay: Duration::from_secs(5) }
    }
}

/// Where replies go. Returns the id of the posted reply.
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    async fn reply_text(&self, in_reply_to: &str, text: &str) -> Result<String, ReplyError>;
    async fn reply_image(&self, in_reply_to: &str, text: &str, image: &Path) -> Result<String, ReplyError>;
}

#[derive(Deserialize)]
struct Posted {
    id_str: String,
}

#[derive(Deserialize)]
struct Uploaded {
    media_id_string: String,
}

pub struct TwitterReplyClient {
    http: reqwest::Client,
    credentials: OAuthCredentials,
    update_url: String,
    upload_url: String,
    retry: RetryPolicy,
}

impl TwitterReplyClient {
    pub fn new(credentials: OAuthCredentials) -> Result<Self, ReplyError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            credentials,
            update_url: UPDATE_URL.to_string(),
            upload_url: UPLOAD_URL.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_urls(mut self, update: impl Into<String>, upload: impl Into<String>) -> Self {
        self.update_url = update.into();
        self.upload_url = upload.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ReplyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ReplyError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    tracing::warn!(what, attempt, error = %e, "request failed, retrying");
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(ReplyError::Exhausted { attempts: attempt, last: Box::new(e) });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_status(&self, params: &[(&str, &str)]) -> Result<String, ReplyError> {
        let auth = self.credentials.authorization_header("POST", &self.update_url, params);
        let response = self
            .http
            .post(&self.update_url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .form(params)
            .send()
            .await?;
        let posted: Posted = check(response).await?.json().await?;
        Ok(posted.id_str)
    }

    async fn upload_once(&self, bytes: &[u8]) -> Result<String, ReplyError> {
        // Multipart bodies are excluded from the signature base.
        let auth = self.credentials.authorization_header("POST", &self.upload_url, &[]);
        let part = Part::bytes(bytes.to_vec()).file_name("stache.jpg").mime_str("image/jpeg")?;
        let response = self
            .http
            .post(&self.upload_url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .multipart(Form::new().part("media", part))
            .send()
            .await?;
        let uploaded: Uploaded = check(response).await?.json().await?;
        Ok(uploaded.media_id_string)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ReplyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ReplyError::Http { status: status.as_u16(), body })
}

#[async_trait]
impl ReplyChannel for TwitterReplyClient {
    async fn reply_text(&self, in_reply_to: &str, text: &str) -> Result<String, ReplyError> {
        let params = [("status", text), ("in_reply_to_status_id", in_reply_to)];
        let id = self.with_retries("reply", || self.post_status(&params)).await?;
        tracing::info!(in_reply_to, reply_id = %id, "posted text reply");
        Ok(id)
    }

    async fn reply_image(&self, in_reply_to: &str, text: &str, image: &Path) -> Result<String, ReplyError> {
        let bytes = tokio::fs::read(image)
            .await
            .map_err(|source| ReplyError::Io { path: image.to_path_buf(), source })?;

        let media_id = self.with_retries("upload", || self.upload_once(&bytes)).await?;
        tracing::debug!(media_id = %media_id, size = bytes.len(), "uploaded image");

        let params = [
            ("status", text),
            ("in_reply_to_status_id", in_reply_to),
            ("media_ids", media_id.as_str()),
        ];
        let id = self.with_retries("reply", || self.post_status(&params)).await?;
        tracing::info!(in_reply_to, reply_id = %id, "posted image reply");
        Ok(id)
    }
}
