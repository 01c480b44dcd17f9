//! Archival of raw mention payloads to a Kafka REST proxy topic.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

pub const KAFKA_CONTENT_TYPE: &str = "application/vnd.kafka.v1+json";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("archive sink returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn publish(&self, payload: &Value) -> Result<(), ArchiveError>;
}

/// Request body carrying one base64-encoded JSON record.
pub fn records_body(payload: &Value) -> Value {
    json!({ "records": [{ "value": STANDARD.encode(payload.to_string()) }] })
}

pub struct KafkaRestSink {
    http: reqwest::Client,
    url: String,
}

impl KafkaRestSink {
    /// `url` is the full topic endpoint, e.g. `http://host:8082/topics/mentions`.
    pub fn new(url: impl Into<String>) -> Result<Self, ArchiveError> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { http, url: url.into() })
    }
}

#[async_trait]
impl ArchiveSink for KafkaRestSink {
    async fn publish(&self, payload: &Value) -> Result<(), ArchiveError> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, KAFKA_CONTENT_TYPE)
            .body(records_body(payload).to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ArchiveError::Http { status: status.as_u16(), body });
        }
        tracing::debug!(status = status.as_u16(), response = %body, "archived mention");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_records_body_is_base64_json() {
        let payload = json!({"id": 1, "text": "hi"});
        let body = records_body(&payload);
        let encoded = body["records"][0]["value"].as_str().unwrap();
        let decoded: Value = serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_publish_posts_records() {
        let server = MockServer::start().await;
        let payload = json!({"id": 42});
        Mock::given(method("POST"))
            .and(header("content-type", KAFKA_CONTENT_TYPE))
            .and(body_json(records_body(&payload)))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"offsets":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        KafkaRestSink::new(server.uri()).unwrap().publish(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no topic"))
            .mount(&server)
            .await;

        let err = KafkaRestSink::new(server.uri()).unwrap().publish(&json!({})).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Http { status: 404, .. }));
    }
}
