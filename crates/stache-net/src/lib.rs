//! stache-net: clients for the services the bot talks to.
//!
//! Each client sits behind a trait ([`ReplyChannel`], [`ModerationService`],
//! [`ImageFetcher`], [`ArchiveSink`], [`Reporter`]) so the mention pipeline
//! can run against fakes.

pub mod archive;
pub mod download;
pub mod mention;
pub mod moderation;
pub mod oauth;
pub mod reply;
pub mod report;
pub mod stream;

pub use archive::{ArchiveError, ArchiveSink, KafkaRestSink};
pub use download::{DownloadError, HttpDownloader, ImageFetcher};
pub use mention::Mention;
pub use moderation::{Likelihood, ModerationError, ModerationService, SafeSearchAnnotation, VisionClient};
pub use oauth::OAuthCredentials;
pub use reply::{ReplyChannel, ReplyError, RetryPolicy, TwitterReplyClient};
pub use report::{Level, Reporter, RollbarReporter};
pub use stream::{StreamClient, StreamConnection, StreamError, StreamEvent};
