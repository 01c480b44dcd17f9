use serde::Deserialize;
use stache_core::CompositorConfig;
use stache_net::OAuthCredentials;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Keys that must be set, checked in this order.
pub const REQUIRED_KEYS: [&str; 6] = [
    "TW_USERNAME",
    "TW_CONSUMER_KEY",
    "TW_CONSUMER_SECRET",
    "TW_ACCESS_TOKEN",
    "TW_ACCESS_TOKEN_SECRET",
    "GOOGLE_VISION_API_KEY",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Reply texts. `{author}` is replaced with the mention author's handle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplyTemplates {
    pub with_image: String,
    pub no_face: String,
}

impl Default for ReplyTemplates {
    fn default() -> Self {
        Self {
            with_image: ".@{author} Nice stache!".to_string(),
            no_face: "@{author} I can't find a face in your image!".to_string(),
        }
    }
}

impl ReplyTemplates {
    pub fn render(template: &str, author: &str) -> String {
        template.replace("{author}", author)
    }
}

/// Contents of the optional `STACHE_CONFIG` TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub replies: ReplyTemplates,
    pub compositor: CompositorConfig,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        toml::from_str(&text).map_err(|source| ConfigError::Settings { path: path.to_path_buf(), source })
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug)]
pub struct Config {
    /// Account whose mentions are tracked, without the `@`.
    pub username: String,
    pub credentials: OAuthCredentials,
    pub vision_api_key: String,
    /// Kafka REST topic endpoint; archival is skipped when unset.
    pub kafka_rest_url: Option<String>,
    pub rollbar_access_key: Option<String>,
    pub rollbar_environment: String,
    pub debug: bool,
    pub model_dir: PathBuf,
    pub overlay_dir: PathBuf,
    /// Parent of the per-mention scratch directories.
    pub work_dir: PathBuf,
    pub settings: Settings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(missing) = REQUIRED_KEYS.iter().find(|k| get(k).is_none()) {
            return Err(ConfigError::Missing(*missing));
        }
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let data_dir = get("STACHE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(stache_core::default_data_dir);

        let mut settings = match get("STACHE_CONFIG") {
            Some(path) => Settings::load(Path::new(&path))?,
            None => Settings::default(),
        };
        if let Some(v) = get("STACHE_MAX_NOSES_PER_FACE") {
            settings.compositor.max_noses_per_face = v
                .parse()
                .map_err(|_| ConfigError::Invalid { key: "STACHE_MAX_NOSES_PER_FACE", value: v })?;
        }

        Ok(Self {
            username: required("TW_USERNAME")?.trim_start_matches('@').to_string(),
            credentials: OAuthCredentials {
                consumer_key: required("TW_CONSUMER_KEY")?,
                consumer_secret: required("TW_CONSUMER_SECRET")?,
                token: required("TW_ACCESS_TOKEN")?,
                token_secret: required("TW_ACCESS_TOKEN_SECRET")?,
            },
            vision_api_key: required("GOOGLE_VISION_API_KEY")?,
            kafka_rest_url: get("KAFKA_REST_URL"),
            rollbar_access_key: get("ROLLBAR_ACCESS_KEY"),
            rollbar_environment: get("ROLLBAR_ENVIRONMENT").unwrap_or_else(|| "production".to_string()),
            debug: debug_flag(get("DEBUG").as_deref()),
            model_dir: get("STACHE_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            overlay_dir: get("STACHE_OVERLAY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("overlays")),
            work_dir: get("STACHE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("stache")),
            settings,
        })
    }

    /// Phrase tracked on the mention stream.
    pub fn track(&self) -> String {
        format!("@{}", self.username)
    }

    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(stache_core::SCRFD_MODEL_FILE)
    }
}

/// `DEBUG=True` (or `true`/`1`) turns on debug logging.
pub fn debug_flag(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("True" | "true" | "1"))
}
