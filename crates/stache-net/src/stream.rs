//! Filtered mention stream: one long-lived POST whose body is
//! newline-delimited JSON.

use crate::mention::Mention;
use crate::oauth::OAuthCredentials;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const STREAM_URL: &str = "https://stream.twitter.com/1.1/statuses/filter.json";

/// HTTP status the stream uses to say "stop reconnecting".
pub const RATE_LIMITED: u16 = 420;

/// The server sends keep-alives every 30 s; three missed ones means a stall.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream rejected with HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no data received for {0:?}")]
    Stalled(Duration),
    #[error("stream closed by server")]
    Closed,
}

impl StreamError {
    /// HTTP status of a rejected connection.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One message from the stream.
#[derive(Debug)]
pub enum StreamEvent {
    Mention(Box<Mention>),
    /// Blank line sent to keep the connection open.
    KeepAlive,
    /// The server is about to close the connection.
    Disconnect { code: u64, reason: String },
    /// Matching posts were withheld because of volume.
    Limit { undelivered: u64 },
    /// Any other notice (deletes, warnings, ...).
    Other(Value),
}

/// Decode one line of the stream.
pub fn parse_line(line: &str) -> Result<StreamEvent, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(StreamEvent::KeepAlive);
    }

    let value: Value = serde_json::from_str(line)?;
    if let Some(d) = value.get("disconnect") {
        return Ok(StreamEvent::Disconnect {
            code: d.get("code").and_then(Value::as_u64).unwrap_or(0),
            reason: d.get("reason").and_then(Value::as_str).unwrap_or_default().to_string(),
        });
    }
    if let Some(l) = value.get("limit") {
        return Ok(StreamEvent::Limit {
            undelivered: l.get("track").and_then(Value::as_u64).unwrap_or(0),
        });
    }
    if value.get("user").is_some() && value.get("id").is_some() {
        return Mention::from_json(value).map(|m| StreamEvent::Mention(Box::new(m)));
    }
    Ok(StreamEvent::Other(value))
}

/// Opens filtered-stream connections.
#[derive(Clone)]
pub struct StreamClient {
    http: reqwest::Client,
    credentials: OAuthCredentials,
    url: String,
    stall_timeout: Duration,
}

impl StreamClient {
    pub fn new(credentials: OAuthCredentials) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            credentials,
            url: STREAM_URL.to_string(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        })
    }

    /// Point at a different endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Connect, tracking the given phrases (e.g. `@username`).
    pub async fn connect(&self, track: &str) -> Result<StreamConnection, StreamError> {
        let auth = self.credentials.authorization_header("POST", &self.url, &[("track", track)]);
        tracing::debug!(url = %self.url, track, "connecting to mention stream");

        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .form(&[("track", track)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Http { status: status.as_u16(), body });
        }

        tracing::info!(track, "mention stream connected");
        Ok(StreamConnection {
            body: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            buf: Vec::new(),
            stall_timeout: self.stall_timeout,
        })
    }
}

/// An open stream. Yields events until the server closes it or it stalls.
pub struct StreamConnection {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
    stall_timeout: Duration,
}

impl StreamConnection {
    pub async fn next_event(&mut self) -> Result<StreamEvent, StreamError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                match parse_line(&String::from_utf8_lossy(&line)) {
                    Ok(event) => return Ok(event),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping undecodable stream line");
                        continue;
                    }
                }
            }

            match tokio::time::timeout(self.stall_timeout, self.body.next()).await {
                Err(_) => return Err(StreamError::Stalled(self.stall_timeout)),
                Ok(None) => return Err(StreamError::Closed),
                Ok(Some(chunk)) => self.buf.extend_from_slice(&chunk?),
            }
        }
    }
}
