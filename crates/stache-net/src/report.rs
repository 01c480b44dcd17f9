//! Error-reporting sink (Rollbar item API).
//!
//! Reporting never fails the caller: transport and HTTP errors are logged at
//! warn and dropped.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

pub const ROLLBAR_URL: &str = "https://api.rollbar.com/api/1/item/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    /// Send one message. `extra` must be a JSON object when present.
    async fn report(&self, level: Level, message: &str, extra: Option<Value>);
}

pub struct RollbarReporter {
    http: reqwest::Client,
    token: Option<String>,
    environment: String,
    url: String,
}

impl RollbarReporter {
    /// A reporter without a token accepts and discards everything.
    pub fn new(token: Option<String>, environment: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            http,
            token: token.filter(|t| !t.is_empty()),
            environment: environment.into(),
            url: ROLLBAR_URL.to_string(),
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    fn item(&self, level: Level, message: &str, extra: Option<Value>) -> Value {
        let mut body = Map::new();
        body.insert("body".into(), Value::String(message.to_string()));
        if let Some(Value::Object(fields)) = extra {
            for (k, v) in fields {
                if k != "body" {
                    body.insert(k, v);
                }
            }
        }
        json!({
            "data": {
                "environment": self.environment,
                "level": level,
                "language": "rust",
                "timestamp": chrono::Utc::now().timestamp(),
                "body": { "message": body },
                "notifier": { "name": "stache", "version": env!("CARGO_PKG_VERSION") },
            }
        })
    }
}

#[async_trait]
impl Reporter for RollbarReporter {
    async fn report(&self, level: Level, message: &str, extra: Option<Value>) {
        let Some(token) = &self.token else {
            return;
        };

        let result = self
            .http
            .post(&self.url)
            .header("X-Rollbar-Access-Token", token)
            .json(&self.item(level, message, extra))
            .send()
            .await;

        match result {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => tracing::warn!(status = r.status().as_u16(), "error report rejected"),
            Err(e) => tracing::warn!(error = %e, "failed to send error report"),
        }
    }
}
