use crate::foundation::core::FrameIndex;
use crate::foundation::error::SketchResult;
use anyhow::Context as _;
use std::path::{Path, PathBuf};

/// File extension used for persisted frames.
pub const FRAME_EXTENSION: &str = "jpg";

/// Directory layout of one recording session.
///
/// Frames live at `drawing<N>.jpg`; the narration, the composed video and the frame manifest use
/// fixed names inside the same directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPaths {
    root: PathBuf,
}

impl SessionPaths {
    /// Layout rooted at `root`. Nothing is created on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Session directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Durable location of frame `index`.
    pub fn frame(&self, index: FrameIndex) -> PathBuf {
        self.root
            .join(format!("drawing{}.{FRAME_EXTENSION}", index.get()))
    }

    /// Narration track.
    pub fn audio(&self) -> PathBuf {
        self.root.join("narration.wav")
    }

    /// Composed output video.
    pub fn video(&self) -> PathBuf {
        self.root.join("composition.mp4")
    }

    /// Sealed frame manifest (timestamps of every persisted frame).
    pub fn manifest(&self) -> PathBuf {
        self.root.join("frames.json")
    }

    /// Create the session directory if missing.
    pub fn ensure(&self) -> SketchResult<()> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("failed to create session directory '{}'", self.root.display())
        })?;
        Ok(())
    }

    /// Delete the whole session directory. A missing directory is not an error.
    pub fn remove_all(&self) -> SketchResult<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!(
                    "failed to remove session directory '{}'",
                    self.root.display()
                ))
                .into()),
        }
    }
}

/// Remove a single file, treating a missing file as success.
pub(crate) fn remove_file_if_exists(path: &Path) -> SketchResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("failed to remove '{}'", path.display()))
            .into()),
    }
}

#[cfg(test)]
#[path = "../tests/unit/session.rs"]
mod tests;
