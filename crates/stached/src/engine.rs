use stache_core::overlay::OverlayError;
use stache_core::{
    CompositeError, CompositeOutcome, Compositor, CompositorConfig, DetectorError, FaceDetector, NoseDetector,
    OverlayLibrary,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Faces narrower or shorter than this are ignored.
pub const MIN_FACE_SIZE: u32 = 30;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),
    #[error("composite error: {0}")]
    Composite(#[from] CompositeError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the mention handler to the engine thread.
enum EngineRequest {
    Composite {
        input: PathBuf,
        output: PathBuf,
        reply: oneshot::Sender<Result<CompositeOutcome, CompositeError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Composite `input` into `output` on the engine thread.
    pub async fn composite(&self, input: PathBuf, output: PathBuf) -> Result<CompositeOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Composite { input, output, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Load the SCRFD model twice (face and nose passes) and the overlay set.
///
/// Fails fast if any resource is missing.
pub fn load_compositor(
    scrfd_path: &Path,
    overlay_dir: &Path,
    config: CompositorConfig,
) -> Result<Compositor, EngineError> {
    let faces = FaceDetector::load(scrfd_path)?.with_min_size(MIN_FACE_SIZE);
    let noses = NoseDetector::load(scrfd_path)?;
    tracing::info!(path = %scrfd_path.display(), "face and nose detectors loaded");

    let overlays = OverlayLibrary::load_dir(overlay_dir)?;
    tracing::info!(dir = %overlay_dir.display(), count = overlays.len(), "overlays loaded");

    Ok(Compositor::new(Box::new(faces), Box::new(noses), overlays, config))
}

/// Spawn the engine on a dedicated OS thread.
///
/// ONNX sessions stay on that thread; requests are served one at a time.
pub fn spawn_engine(mut compositor: Compositor) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("stache-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Composite { input, output, reply } => {
                        let result = compositor.composite(&input, &output);
                        if let Err(e) = &result {
                            tracing::debug!(error = %e, input = %input.display(), "composite failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
