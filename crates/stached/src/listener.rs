//! Mention handling and the stream supervisor.
//!
//! [`MentionHandler::handle`] runs the whole pipeline for one mention:
//! archive, moderate, download, composite, reply. [`run`] keeps the stream
//! connected and feeds mentions to the handler one at a time.

use crate::config::ReplyTemplates;
use crate::engine::{EngineError, EngineHandle};
use crate::scratch::Scratch;
use serde_json::json;
use stache_net::moderation::REJECT_ABOVE;
use stache_net::stream::RATE_LIMITED;
use stache_net::{
    ArchiveSink, ImageFetcher, Level, Mention, ModerationService, ReplyChannel, ReplyError, Reporter, StreamClient,
    StreamError, StreamEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandleError {
    #[error("failed to post reply: {0}")]
    Reply(#[from] ReplyError),
    #[error("compositing failed: {0}")]
    Engine(#[from] EngineError),
    #[error("scratch directory: {0}")]
    Scratch(#[source] std::io::Error),
}

/// How a mention was dealt with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Repost,
    NoMedia,
    Rejected { flagged: Vec<&'static str> },
    ModerationFailed,
    DownloadFailed,
    RepliedWithImage { reply_id: String },
    RepliedNoFace { reply_id: String },
}

/// Everything needed to process one mention.
pub struct MentionHandler {
    pub archive: Option<Arc<dyn ArchiveSink>>,
    pub moderation: Arc<dyn ModerationService>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub replies: Arc<dyn ReplyChannel>,
    pub reporter: Arc<dyn Reporter>,
    pub engine: EngineHandle,
    pub work_dir: PathBuf,
    pub templates: ReplyTemplates,
}

impl MentionHandler {
    pub async fn handle(&self, mention: &Mention) -> Result<Handled, HandleError> {
        if mention.is_repost {
            tracing::debug!(id = mention.id, "ignoring repost");
            return Ok(Handled::Repost);
        }

        self.archive(mention).await;

        tracing::info!(
            id = mention.id,
            author = %mention.author,
            created_at = ?mention.created_at,
            text = %mention.text,
            "found mention"
        );
        self.reporter
            .report(
                Level::Info,
                &format!("Found mention in {} from {}", mention.id_str, mention.author),
                Some(mention.summary()),
            )
            .await;

        let Some(url) = mention.media_url.as_deref() else {
            tracing::debug!(id = mention.id, "no image attached");
            return Ok(Handled::NoMedia);
        };

        tracing::debug!(url, "checking image safety");
        let annotation = match self.moderation.check(url).await {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(url, error = %e, "moderation check failed");
                self.reporter
                    .report(Level::Error, &format!("Moderation check failed for {url}: {e}"), None)
                    .await;
                return Ok(Handled::ModerationFailed);
            }
        };
        if !annotation.is_safe(REJECT_ABOVE) {
            let flagged = annotation.flagged(REJECT_ABOVE);
            tracing::error!(url, ?flagged, "ignoring mention with unsafe image");
            let ratings: serde_json::Map<String, serde_json::Value> = annotation
                .categories()
                .iter()
                .map(|(name, l)| (name.to_string(), json!(l.as_str())))
                .collect();
            self.reporter
                .report(
                    Level::Error,
                    &format!("Detected unsafe image {url}"),
                    Some(serde_json::Value::Object(ratings)),
                )
                .await;
            return Ok(Handled::Rejected { flagged });
        }

        let scratch = Scratch::create(&self.work_dir).map_err(HandleError::Scratch)?;

        tracing::info!(url, scratch = %scratch.path().display(), "downloading image");
        if let Err(e) = self.fetcher.fetch(url, &scratch.source()).await {
            tracing::error!(url, error = %e, "failed to download image");
            self.reporter
                .report(Level::Error, "Failed to download image.", Some(json!({ "url": url, "error": e.to_string() })))
                .await;
            return Ok(Handled::DownloadFailed);
        }

        tracing::info!("applying mustache to image");
        let outcome = match self.engine.composite(scratch.source(), scratch.annotated()).await {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(url, error = %e, "compositing failed");
                self.reporter
                    .report(Level::Error, &format!("Failed to composite image: {e}"), None)
                    .await;
                return Err(e.into());
            }
        };

        let result = if outcome.is_written() {
            let text = ReplyTemplates::render(&self.templates.with_image, &mention.author);
            tracing::info!(reply = %text, "sending image reply");
            self.replies
                .reply_image(&mention.id_str, &text, &scratch.annotated())
                .await
                .map(|reply_id| Handled::RepliedWithImage { reply_id })
        } else {
            tracing::info!("no face detected");
            let text = ReplyTemplates::render(&self.templates.no_face, &mention.author);
            tracing::info!(reply = %text, "sending text reply");
            self.replies
                .reply_text(&mention.id_str, &text)
                .await
                .map(|reply_id| Handled::RepliedNoFace { reply_id })
        };

        match result {
            Ok(handled) => Ok(handled),
            Err(e) => {
                tracing::error!(id = mention.id, error = %e, "failed to post reply");
                self.reporter.report(Level::Error, "Failed to post reply.", None).await;
                Err(e.into())
            }
        }
    }

    async fn archive(&self, mention: &Mention) {
        let Some(sink) = &self.archive else {
            tracing::warn!("KAFKA_REST_URL undefined; mention won't be archived");
            return;
        };
        if let Err(e) = sink.publish(&mention.raw).await {
            tracing::error!(id = mention.id, error = %e, "failed to archive mention");
        }
    }
}

/// Reconnect timing for the stream supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub http_initial: Duration,
    pub http_max: Duration,
    pub network_step: Duration,
    pub network_max: Duration,
    /// Fixed wait after a stalled stream before reconnecting.
    pub stall_pause: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            http_initial: Duration::from_secs(5),
            http_max: Duration::from_secs(320),
            network_step: Duration::from_millis(250),
            network_max: Duration::from_secs(16),
            stall_pause: Duration::from_secs(60),
        }
    }
}

/// Reconnect delays for the stream supervisor.
#[derive(Debug, Default)]
pub struct Backoff {
    pacing: Pacing,
    http: Option<Duration>,
    network: Duration,
}

impl Backoff {
    pub fn new(pacing: Pacing) -> Self {
        Self { pacing, http: None, network: Duration::ZERO }
    }

    /// Exponential: 5 s doubling to 320 s by default.
    pub fn after_http_error(&mut self) -> Duration {
        let next = match self.http {
            None => self.pacing.http_initial,
            Some(d) => (d * 2).min(self.pacing.http_max),
        };
        self.http = Some(next);
        next
    }

    /// Linear: 250 ms steps up to 16 s by default.
    pub fn after_network_error(&mut self) -> Duration {
        self.network = (self.network + self.pacing.network_step).min(self.pacing.network_max);
        self.network
    }

    pub fn reset(&mut self) {
        self.http = None;
        self.network = Duration::ZERO;
    }
}

/// Keep the mention stream open and handle mentions until rate limited.
///
/// Returns only with the 420 error; every other failure reconnects. Backoff
/// is cleared once a connection delivers its first event, so a server that
/// accepts and immediately hangs up sees growing delays.
pub async fn run(stream: &StreamClient, track: &str, handler: &MentionHandler, pacing: Pacing) -> StreamError {
    let reporter = &handler.reporter;
    let mut backoff = Backoff::new(pacing);

    loop {
        let mut conn = match stream.connect(track).await {
            Ok(c) => c,
            Err(e) => {
                let Some(status) = e.status_code() else {
                    let delay = backoff.after_network_error();
                    tracing::warn!(error = %e, ?delay, "stream connection failed");
                    tokio::time::sleep(delay).await;
                    continue;
                };
                tracing::error!(status, error = %e, "stream listener threw error code");
                reporter
                    .report(Level::Error, &format!("Stream listener threw error code {status}"), None)
                    .await;
                if status == RATE_LIMITED {
                    tracing::error!("stream listener is rate limited; not reconnecting");
                    reporter
                        .report(Level::Error, "Stream listener is rate limited. Try restarting again.", None)
                        .await;
                    return e;
                }
                let delay = backoff.after_http_error();
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let mut delivered = false;
        loop {
            let event = conn.next_event().await;
            if !delivered && event.as_ref().is_ok_and(|ev| !matches!(ev, StreamEvent::Disconnect { .. })) {
                delivered = true;
                backoff.reset();
            }
            match event {
                Ok(StreamEvent::Mention(mention)) => {
                    if let Err(e) = handler.handle(&mention).await {
                        tracing::error!(id = mention.id, error = %e, "mention handling failed");
                    }
                }
                Ok(StreamEvent::KeepAlive) => tracing::trace!("keep-alive"),
                Ok(StreamEvent::Limit { undelivered }) => {
                    tracing::warn!(undelivered, "stream limit notice");
                }
                Ok(StreamEvent::Disconnect { code, reason }) => {
                    let delay = backoff.after_network_error();
                    tracing::warn!(code, %reason, ?delay, "stream disconnect notice");
                    tokio::time::sleep(delay).await;
                    break;
                }
                Ok(StreamEvent::Other(_)) => {}
                Err(StreamError::Stalled(after)) => {
                    tracing::error!(?after, "stream listener timeout");
                    reporter.report(Level::Error, "Stream listener timeout.", None).await;
                    tracing::debug!(pause = ?pacing.stall_pause, "sleeping before reconnect");
                    tokio::time::sleep(pacing.stall_pause).await;
                    break;
                }
                Err(e) => {
                    let delay = backoff.after_network_error();
                    tracing::warn!(error = %e, ?delay, "stream dropped; reconnecting");
                    tokio::time::sleep(delay).await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use async_trait::async_trait;
    use image::{GrayImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use serde_json::Value;
    use stache_core::overlay::OverlayAsset;
    use stache_core::{Compositor, CompositorConfig, Detector, DetectorError, FixedChooser, OverlayLibrary, Rect};
    use stache_net::moderation::SafeSearchAnnotation;
    use stache_net::{ArchiveError, DownloadError, Likelihood, ModerationError, OAuthCredentials};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        reports: Mutex<Vec<(Level, String)>>,
        archived: Mutex<Vec<Value>>,
        fetched: Mutex<Vec<String>>,
        moderated: Mutex<Vec<String>>,
        /// (kind, in_reply_to, text, image existed at send time)
        replies: Mutex<Vec<(&'static str, String, String, bool)>>,
    }

    impl Recorder {
        fn reports_at(&self, level: Level) -> Vec<String> {
            let reports = self.reports.lock().unwrap();
            reports.iter().filter(|(l, _)| *l == level).map(|(_, m)| m.clone()).collect()
        }
    }

    struct FakeReporter(Arc<Recorder>);

    #[async_trait]
    impl Reporter for FakeReporter {
        async fn report(&self, level: Level, message: &str, _extra: Option<Value>) {
            self.0.reports.lock().unwrap().push((level, message.to_string()));
        }
    }

    struct FakeArchive {
        rec: Arc<Recorder>,
        fail: bool,
    }

    #[async_trait]
    impl ArchiveSink for FakeArchive {
        async fn publish(&self, payload: &Value) -> Result<(), ArchiveError> {
            self.rec.archived.lock().unwrap().push(payload.clone());
            if self.fail {
                return Err(ArchiveError::Http { status: 500, body: "down".into() });
            }
            Ok(())
        }
    }

    struct FakeModeration {
        rec: Arc<Recorder>,
        verdict: Option<SafeSearchAnnotation>,
    }

    #[async_trait]
    impl ModerationService for FakeModeration {
        async fn check(&self, image_uri: &str) -> Result<SafeSearchAnnotation, ModerationError> {
            self.rec.moderated.lock().unwrap().push(image_uri.to_string());
            self.verdict.ok_or(ModerationError::MissingAnnotation)
        }
    }

    struct FakeFetcher {
        rec: Arc<Recorder>,
        fail: bool,
    }

    #[async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
            self.rec.fetched.lock().unwrap().push(url.to_string());
            if self.fail {
                return Err(DownloadError::Http { url: url.to_string(), status: 404 });
            }
            RgbImage::from_pixel(600, 600, Rgb([220, 200, 180]))
                .save_with_format(dest, ImageFormat::Png)
                .unwrap();
            Ok(std::fs::metadata(dest).unwrap().len())
        }
    }

    struct FakeReplies {
        rec: Arc<Recorder>,
        fail: bool,
    }

    impl FakeReplies {
        fn outcome(&self) -> Result<String, ReplyError> {
            if self.fail {
                return Err(ReplyError::Http { status: 403, body: "suspended".into() });
            }
            Ok("reply-1".into())
        }
    }

    #[async_trait]
    impl ReplyChannel for FakeReplies {
        async fn reply_text(&self, in_reply_to: &str, text: &str) -> Result<String, ReplyError> {
            self.rec.replies.lock().unwrap().push(("text", in_reply_to.into(), text.into(), false));
            self.outcome()
        }

        async fn reply_image(&self, in_reply_to: &str, text: &str, image: &Path) -> Result<String, ReplyError> {
            self.rec
                .replies
                .lock()
                .unwrap()
                .push(("image", in_reply_to.into(), text.into(), image.exists()));
            self.outcome()
        }
    }

    struct Fixed(Vec<Rect>);

    impl Detector for Fixed {
        fn detect(&mut self, _gray: &GrayImage, _roi: Rect) -> Result<Vec<Rect>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Clone, Copy)]
    struct Setup {
        archive: Option<bool>,
        safe: Option<bool>,
        download_fails: bool,
        faces: bool,
        reply_fails: bool,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self { archive: Some(false), safe: Some(true), download_fails: false, faces: true, reply_fails: false }
        }
    }

    fn handler(setup: Setup, work_dir: &Path) -> (MentionHandler, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());

        let verdict = setup.safe.map(|safe| {
            let mut a = SafeSearchAnnotation::default();
            a.adult = if safe { Likelihood::VeryUnlikely } else { Likelihood::VeryLikely };
            a.racy = Likelihood::Unlikely;
            a
        });

        let sprite = RgbaImage::from_pixel(30, 10, Rgba([0, 0, 0, 255]));
        let overlays = OverlayLibrary::from_assets(vec![OverlayAsset::from_rgba("black.png", &sprite)]).unwrap();
        let faces = if setup.faces { vec![Rect::new(100, 100, 200, 200)] } else { vec![] };
        let compositor = Compositor::new(
            Box::new(Fixed(faces)),
            Box::new(Fixed(vec![Rect::new(80, 90, 40, 40)])),
            overlays,
            CompositorConfig::default(),
        )
        .with_chooser(Box::new(FixedChooser(0)));

        let handler = MentionHandler {
            archive: setup.archive.map(|fail| Arc::new(FakeArchive { rec: rec.clone(), fail }) as Arc<dyn ArchiveSink>),
            moderation: Arc::new(FakeModeration { rec: rec.clone(), verdict }),
            fetcher: Arc::new(FakeFetcher { rec: rec.clone(), fail: setup.download_fails }),
            replies: Arc::new(FakeReplies { rec: rec.clone(), fail: setup.reply_fails }),
            reporter: Arc::new(FakeReporter(rec.clone())),
            engine: spawn_engine(compositor).unwrap(),
            work_dir: work_dir.to_path_buf(),
            templates: ReplyTemplates::default(),
        };
        (handler, rec)
    }

    fn status(media: bool) -> Value {
        let mut v = json!({
            "id": 1050118621198921728u64,
            "id_str": "1050118621198921728",
            "text": "@stashorizer do me!",
            "user": {"screen_name": "alice", "followers_count": 5, "statuses_count": 9},
            "entities": {}
        });
        if media {
            v["entities"] = json!({"media": [{"media_url_https": "https://pbs.example/a.jpg"}]});
        }
        v
    }

    fn mention(media: bool) -> Mention {
        Mention::from_json(status(media)).unwrap()
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_face_gets_image_reply() {
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup::default(), work.path());

        let handled = h.handle(&mention(true)).await.unwrap();
        assert_eq!(handled, Handled::RepliedWithImage { reply_id: "reply-1".into() });

        let replies = rec.replies.lock().unwrap().clone();
        assert_eq!(replies.len(), 1);
        let (kind, to, text, image_existed) = &replies[0];
        assert_eq!(*kind, "image");
        assert_eq!(to, "1050118621198921728");
        assert!(text.contains("@alice"));
        assert!(*image_existed);

        assert_eq!(rec.archived.lock().unwrap().len(), 1);
        assert_eq!(rec.fetched.lock().unwrap().as_slice(), ["https://pbs.example/a.jpg"]);
        assert!(dir_is_empty(work.path()), "scratch left behind");
    }

    #[tokio::test]
    async fn test_no_face_gets_text_reply() {
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup { faces: false, ..Setup::default() }, work.path());

        let handled = h.handle(&mention(true)).await.unwrap();
        assert_eq!(handled, Handled::RepliedNoFace { reply_id: "reply-1".into() });

        let replies = rec.replies.lock().unwrap().clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, "text");
        assert_eq!(replies[0].2, "@alice I can't find a face in your image!");
        assert!(dir_is_empty(work.path()));
    }

    #[tokio::test]
    async fn test_unsafe_image_is_rejected_without_reply() {
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup { safe: Some(false), ..Setup::default() }, work.path());

        let handled = h.handle(&mention(true)).await.unwrap();
        assert_eq!(handled, Handled::Rejected { flagged: vec!["adult"] });
        assert!(rec.fetched.lock().unwrap().is_empty());
        assert!(rec.replies.lock().unwrap().is_empty());
        assert!(rec
            .reports_at(Level::Error)
            .iter()
            .any(|m| m.starts_with("Detected unsafe image")));
    }

    #[tokio::test]
    async fn test_moderation_failure_is_not_answered() {
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup { safe: None, ..Setup::default() }, work.path());

        assert_eq!(h.handle(&mention(true)).await.unwrap(), Handled::ModerationFailed);
        assert!(rec.fetched.lock().unwrap().is_empty());
        assert!(rec.replies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repost_takes_no_action() {
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup::default(), work.path());
        let mut raw = status(true);
        raw["retweeted_status"] = json!({"id": 1});

        let handled = h.handle(&Mention::from_json(raw).unwrap()).await.unwrap();
        assert_eq!(handled, Handled::Repost);
        assert!(rec.archived.lock().unwrap().is_empty());
        assert!(rec.reports.lock().unwrap().is_empty());
        assert!(rec.moderated.lock().unwrap().is_empty());
        assert!(rec.replies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_media_stops_after_report() {
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup::default(), work.path());

        assert_eq!(h.handle(&mention(false)).await.unwrap(), Handled::NoMedia);
        assert_eq!(rec.archived.lock().unwrap().len(), 1);
        assert_eq!(rec.reports_at(Level::Info).len(), 1);
        assert!(rec.moderated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_failure_is_not_fatal() {
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup { archive: Some(true), ..Setup::default() }, work.path());

        let handled = h.handle(&mention(true)).await.unwrap();
        assert!(matches!(handled, Handled::RepliedWithImage { .. }));
        assert_eq!(rec.archived.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_without_archive_sink() {
        let work = tempfile::tempdir().unwrap();
        let (h, _rec) = handler(Setup { archive: None, ..Setup::default() }, work.path());
        assert!(matches!(h.handle(&mention(true)).await.unwrap(), Handled::RepliedWithImage { .. }));
    }

    #[tokio::test]
    async fn test_download_failure_is_reported_without_reply() {
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup { download_fails: true, ..Setup::default() }, work.path());

        assert_eq!(h.handle(&mention(true)).await.unwrap(), Handled::DownloadFailed);
        assert!(rec.replies.lock().unwrap().is_empty());
        assert_eq!(rec.reports_at(Level::Error), vec!["Failed to download image.".to_string()]);
        assert!(dir_is_empty(work.path()));
    }

    #[tokio::test]
    async fn test_reply_failure_still_cleans_up() {
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup { reply_fails: true, ..Setup::default() }, work.path());

        let err = h.handle(&mention(true)).await.unwrap_err();
        assert!(matches!(err, HandleError::Reply(_)));
        assert_eq!(rec.replies.lock().unwrap().len(), 1);
        assert_eq!(rec.reports_at(Level::Error), vec!["Failed to post reply.".to_string()]);
        assert!(dir_is_empty(work.path()), "scratch left behind");
    }

    #[test]
    fn test_http_backoff_doubles_to_cap() {
        let mut b = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| b.after_http_error().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320, 320]);
        b.reset();
        assert_eq!(b.after_http_error(), Duration::from_secs(5));
    }

    #[test]
    fn test_network_backoff_is_linear_to_cap() {
        let mut b = Backoff::default();
        assert_eq!(b.after_network_error(), Duration::from_millis(250));
        assert_eq!(b.after_network_error(), Duration::from_millis(500));
        for _ in 0..100 {
            b.after_network_error();
        }
        assert_eq!(b.after_network_error(), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_follows_pacing() {
        let mut b = Backoff::new(quick_pacing());
        assert_eq!(b.after_network_error(), Duration::from_millis(100));
        assert_eq!(b.after_network_error(), Duration::from_millis(200));
        assert_eq!(b.after_http_error(), Duration::from_millis(100));
        assert_eq!(b.after_http_error(), Duration::from_millis(200));
        b.reset();
        assert_eq!(b.after_network_error(), Duration::from_millis(100));
    }

    fn creds() -> OAuthCredentials {
        OAuthCredentials {
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            token: "t".into(),
            token_secret: "ts".into(),
        }
    }

    fn quick_pacing() -> Pacing {
        Pacing {
            http_initial: Duration::from_millis(100),
            http_max: Duration::from_secs(1),
            network_step: Duration::from_millis(100),
            network_max: Duration::from_secs(1),
            stall_pause: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_supervisor_handles_mentions_then_stops_on_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("{}\r\n", status(false))))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(420))
            .mount(&server)
            .await;

        let stream = StreamClient::new(creds()).unwrap().with_url(server.uri());
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup::default(), work.path());

        let err = run(&stream, "@stashorizer", &h, quick_pacing()).await;
        assert_eq!(err.status_code(), Some(RATE_LIMITED));
        assert_eq!(rec.archived.lock().unwrap().len(), 1, "mention from first connection handled");
        let errors = rec.reports_at(Level::Error);
        assert!(errors.contains(&"Stream listener threw error code 420".to_string()));
        assert!(errors.contains(&"Stream listener is rate limited. Try restarting again.".to_string()));
    }

    #[tokio::test]
    async fn test_reconnect_delay_grows_while_server_hangs_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("{\"disconnect\":{\"code\":7,\"reason\":\"admin logout\"}}\r\n"),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(420))
            .mount(&server)
            .await;

        let stream = StreamClient::new(creds()).unwrap().with_url(server.uri());
        let work = tempfile::tempdir().unwrap();
        let (h, _rec) = handler(Setup::default(), work.path());

        let started = tokio::time::Instant::now();
        let err = run(&stream, "@stashorizer", &h, quick_pacing()).await;
        assert_eq!(err.status_code(), Some(RATE_LIMITED));
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
        // 100 + 200 + 300 ms: neither a disconnect notice nor an empty body clears the backoff.
        assert!(started.elapsed() >= Duration::from_millis(600), "elapsed {:?}", started.elapsed());
    }

    /// First connection sends headers and then goes quiet; every later one is rate limited.
    async fn stalling_then_limited_server(accepted: Arc<AtomicUsize>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                if accepted.fetch_add(1, Ordering::SeqCst) == 0 {
                    socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n")
                        .await
                        .unwrap();
                    held.push(socket);
                } else {
                    socket
                        .write_all(b"HTTP/1.1 420 Enhance Your Calm\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await
                        .unwrap();
                }
            }
        });
        format!("http://{addr}/1.1/statuses/filter.json")
    }

    #[tokio::test]
    async fn test_stalled_stream_is_reported_then_reconnected() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let url = stalling_then_limited_server(accepted.clone()).await;
        let stream = StreamClient::new(creds())
            .unwrap()
            .with_url(url)
            .with_stall_timeout(Duration::from_millis(200));
        let work = tempfile::tempdir().unwrap();
        let (h, rec) = handler(Setup::default(), work.path());

        let err = run(&stream, "@stashorizer", &h, quick_pacing()).await;
        assert_eq!(err.status_code(), Some(RATE_LIMITED));
        assert_eq!(accepted.load(Ordering::SeqCst), 2, "reconnected after the stall");
        let errors = rec.reports_at(Level::Error);
        assert_eq!(errors[0], "Stream listener timeout.");
        assert!(errors.contains(&"Stream listener threw error code 420".to_string()));
    }
}
