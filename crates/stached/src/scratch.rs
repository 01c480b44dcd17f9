use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Per-mention working directory, removed with everything in it on drop.
pub struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    pub fn create(root: &Path) -> io::Result<Self> {
        let dir = root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir)?;
        tracing::debug!(dir = %dir.display(), "created scratch directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Downloaded source image. No extension: the format is sniffed on read.
    pub fn source(&self) -> PathBuf {
        self.dir.join("source")
    }

    /// Composited output.
    pub fn annotated(&self) -> PathBuf {
        self.dir.join("annotated.jpg")
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!(dir = %self.dir.display(), "removed scratch directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(dir = %self.dir.display(), error = %e, "failed to remove scratch directory"),
        }
    }
}
