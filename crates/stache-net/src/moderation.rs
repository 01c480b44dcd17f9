//! Image moderation via Vision SafeSearch detection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

pub const VISION_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Images rated above this in any category are rejected.
pub const REJECT_ABOVE: Likelihood = Likelihood::Unlikely;

#[derive(Error, Debug)]
pub enum ModerationError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("moderation API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("moderation API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("response carried no safe-search annotation")]
    MissingAnnotation,
}

/// Ordered confidence scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Likelihood {
    #[default]
    Unknown,
    VeryUnlikely,
    Unlikely,
    Possible,
    Likely,
    VeryLikely,
}

impl Likelihood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::VeryUnlikely => "VERY_UNLIKELY",
            Self::Unlikely => "UNLIKELY",
            Self::Possible => "POSSIBLE",
            Self::Likely => "LIKELY",
            Self::VeryLikely => "VERY_LIKELY",
        }
    }
}

impl std::fmt::Display for Likelihood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category ratings for one image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeSearchAnnotation {
    pub adult: Likelihood,
    pub spoof: Likelihood,
    pub medical: Likelihood,
    pub violence: Likelihood,
    pub racy: Likelihood,
}

impl SafeSearchAnnotation {
    pub fn categories(&self) -> [(&'static str, Likelihood); 5] {
        [
            ("adult", self.adult),
            ("medical", self.medical),
            ("spoof", self.spoof),
            ("violence", self.violence),
            ("racy", self.racy),
        ]
    }

    /// Categories rated strictly above `threshold`.
    pub fn flagged(&self, threshold: Likelihood) -> Vec<&'static str> {
        self.categories()
            .into_iter()
            .filter(|(_, l)| *l > threshold)
            .map(|(name, _)| name)
            .collect()
    }

    /// True if no category exceeds `threshold`.
    pub fn is_safe(&self, threshold: Likelihood) -> bool {
        self.categories().iter().all(|(_, l)| *l <= threshold)
    }
}

/// Something that can rate an image by URI.
#[async_trait]
pub trait ModerationService: Send + Sync {
    async fn check(&self, image_uri: &str) -> Result<SafeSearchAnnotation, ModerationError>;
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    #[serde(default)]
    safe_search_annotation: Option<SafeSearchAnnotation>,
    #[serde(default)]
    error: Option<ApiStatus>,
}

#[derive(Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// REST client for `images:annotate`, authenticated with an API key.
#[derive(Clone)]
pub struct VisionClient {
    http: reqwest::Client,
    api_key: String,
    url: String,
}

impl VisionClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ModerationError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, api_key: api_key.into(), url: VISION_URL.to_string() })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl ModerationService for VisionClient {
    async fn check(&self, image_uri: &str) -> Result<SafeSearchAnnotation, ModerationError> {
        let body = json!({
            "requests": [{
                "image": { "source": { "imageUri": image_uri } },
                "features": [{ "type": "SAFE_SEARCH_DETECTION" }],
            }]
        });

        let response = self
            .http
            .post(&self.url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModerationError::Http { status: status.as_u16(), body });
        }

        let parsed: AnnotateResponse = response.json().await?;
        let first = parsed.responses.into_iter().next().ok_or(ModerationError::MissingAnnotation)?;
        if let Some(err) = first.error {
            return Err(ModerationError::Api { code: err.code, message: err.message });
        }
        let annotation = first.safe_search_annotation.ok_or(ModerationError::MissingAnnotation)?;

        tracing::debug!(
            uri = image_uri,
            adult = %annotation.adult,
            medical = %annotation.medical,
            spoofed = %annotation.spoof,
            violence = %annotation.violence,
            racy = %annotation.racy,
            "safe search"
        );
        Ok(annotation)
    }
}
