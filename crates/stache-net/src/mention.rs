//! Mention records decoded from status JSON.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

#[derive(Deserialize)]
struct RawStatus {
    id: u64,
    #[serde(default)]
    id_str: Option<String>,
    #[serde(default, alias = "full_text")]
    text: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    favorite_count: u64,
    user: RawUser,
    #[serde(default)]
    entities: RawEntities,
    #[serde(default)]
    retweeted_status: Option<Value>,
    #[serde(default)]
    quoted_status: Option<Value>,
}

#[derive(Deserialize)]
struct RawUser {
    screen_name: String,
    #[serde(default)]
    followers_count: u64,
    #[serde(default)]
    statuses_count: u64,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawEntities {
    #[serde(default)]
    media: Vec<RawMedia>,
}

#[derive(Deserialize)]
struct RawMedia {
    #[serde(default)]
    media_url_https: Option<String>,
    #[serde(default)]
    media_url: Option<String>,
}

/// A post that mentions the bot.
#[derive(Debug, Clone)]
pub struct Mention {
    pub id: u64,
    pub id_str: String,
    pub author: String,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    /// First attached image, if any.
    pub media_url: Option<String>,
    pub favorite_count: u64,
    pub followers_count: u64,
    pub statuses_count: u64,
    pub author_location: Option<String>,
    /// Retweet or quote of another post.
    pub is_repost: bool,
    /// The payload exactly as received, for archival.
    pub raw: Value,
}

impl Mention {
    pub fn from_json(raw: Value) -> Result<Self, serde_json::Error> {
        let status = RawStatus::deserialize(&raw)?;

        let media_url = status
            .entities
            .media
            .into_iter()
            .next()
            .and_then(|m| m.media_url_https.or(m.media_url));

        let created_at = status.created_at.as_deref().and_then(|s| {
            DateTime::parse_from_str(s, CREATED_AT_FORMAT)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| tracing::debug!(created_at = s, error = %e, "unparseable created_at"))
                .ok()
        });

        Ok(Self {
            id: status.id,
            id_str: status.id_str.unwrap_or_else(|| status.id.to_string()),
            author: status.user.screen_name,
            text: status.text,
            created_at,
            media_url,
            favorite_count: status.favorite_count,
            followers_count: status.user.followers_count,
            statuses_count: status.user.statuses_count,
            author_location: status.user.location,
            is_repost: status.retweeted_status.is_some() || status.quoted_status.is_some(),
            raw,
        })
    }

    /// Compact description used in log and report items.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "id_str": self.id_str,
            "text": self.text,
            "favorite_count": self.favorite_count,
            "user_screen_name": self.author,
            "user_statuses_count": self.statuses_count,
            "user_location": self.author_location,
            "followers_count": self.followers_count,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn status_json() -> Value {
        json!({
            "created_at": "Wed Oct 10 20:19:24 +0000 2018",
            "id": 1050118621198921728u64,
            "id_str": "1050118621198921728",
            "text": "@stashorizer do me!",
            "favorite_count": 3,
            "user": {
                "screen_name": "alice",
                "followers_count": 120,
                "statuses_count": 4500,
                "location": "Lisbon"
            },
            "entities": {
                "media": [
                    {"media_url": "http://pbs.example/a.jpg", "media_url_https": "https://pbs.example/a.jpg"},
                    {"media_url": "http://pbs.example/b.jpg"}
                ]
            }
        })
    }

    #[test]
    fn test_parse_status_with_media() {
        let m = Mention::from_json(status_json()).unwrap();
        assert_eq!(m.id, 1050118621198921728);
        assert_eq!(m.author, "alice");
        assert_eq!(m.media_url.as_deref(), Some("https://pbs.example/a.jpg"));
        assert_eq!(m.followers_count, 120);
        assert!(!m.is_repost);
        assert_eq!(m.created_at.unwrap().to_rfc3339(), "2018-10-10T20:19:24+00:00");
        assert_eq!(m.raw, status_json());
    }

    #[test]
    fn test_parse_status_without_media() {
        let mut raw = status_json();
        raw["entities"] = json!({"hashtags": []});
        let m = Mention::from_json(raw).unwrap();
        assert!(m.media_url.is_none());
    }

    #[test]
    fn test_retweet_and_quote_are_reposts() {
        let mut rt = status_json();
        rt["retweeted_status"] = json!({"id": 1});
        assert!(Mention::from_json(rt).unwrap().is_repost);

        let mut quote = status_json();
        quote["quoted_status"] = json!({"id": 2});
        assert!(Mention::from_json(quote).unwrap().is_repost);
    }

    #[test]
    fn test_missing_user_is_error() {
        let mut raw = status_json();
        raw.as_object_mut().unwrap().remove("user");
        assert!(Mention::from_json(raw).is_err());
    }

    #[test]
    fn test_summary_fields() {
        let s = Mention::from_json(status_json()).unwrap().summary();
        assert_eq!(s["user_screen_name"], "alice");
        assert_eq!(s["user_location"], "Lisbon");
        assert_eq!(s["user_statuses_count"], 4500);
    }
}
