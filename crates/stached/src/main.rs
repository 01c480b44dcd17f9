use anyhow::{Context, Result};
use stache_net::{
    ArchiveSink, HttpDownloader, KafkaRestSink, Level, Reporter, RollbarReporter, StreamClient, TwitterReplyClient,
    VisionClient,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod listener;
mod scratch;

use config::Config;
use listener::{MentionHandler, Pacing};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the environment may already be set.
    let _ = dotenvy::dotenv();

    let debug = config::debug_flag(std::env::var("DEBUG").ok().as_deref());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("stached starting");

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        username = %config.username,
        model_dir = %config.model_dir.display(),
        overlay_dir = %config.overlay_dir.display(),
        archive = config.kafka_rest_url.is_some(),
        debug = config.debug,
        "configuration loaded"
    );
    let rollbar = RollbarReporter::new(config.rollbar_access_key.clone(), config.rollbar_environment.clone())?;
    if !rollbar.is_enabled() {
        tracing::warn!("ROLLBAR_ACCESS_KEY undefined; error reporting disabled");
    }
    let reporter: Arc<dyn Reporter> = Arc::new(rollbar);
    reporter.report(Level::Info, "Error reporting is configured correctly", None).await;

    let result = tokio::select! {
        r = run_bot(&config, reporter.clone()) => r,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; shutting down");
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = ?e, "stached exiting on error");
        reporter.report(Level::Critical, &format!("{e:#}"), None).await;
    }
    result
}

async fn run_bot(config: &Config, reporter: Arc<dyn Reporter>) -> Result<()> {
    let compositor = engine::load_compositor(
        &config.scrfd_model_path(),
        &config.overlay_dir,
        config.settings.compositor.clone(),
    )?;
    let engine = engine::spawn_engine(compositor)?;

    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("creating work directory {}", config.work_dir.display()))?;

    let archive = match &config.kafka_rest_url {
        Some(url) => Some(Arc::new(KafkaRestSink::new(url.clone())?) as Arc<dyn ArchiveSink>),
        None => None,
    };

    let handler = MentionHandler {
        archive,
        moderation: Arc::new(VisionClient::new(config.vision_api_key.clone())?),
        fetcher: Arc::new(HttpDownloader::new()?),
        replies: Arc::new(TwitterReplyClient::new(config.credentials.clone())?),
        reporter,
        engine,
        work_dir: config.work_dir.clone(),
        templates: config.settings.replies.clone(),
    };

    let stream = StreamClient::new(config.credentials.clone())?;
    let track = config.track();
    tracing::info!(%track, "stached ready");

    let stopped = listener::run(&stream, &track, &handler, Pacing::default()).await;
    Err(anyhow::Error::new(stopped).context("mention stream stopped"))
}
