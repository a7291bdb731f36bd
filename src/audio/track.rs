use crate::foundation::error::{SketchError, SketchResult};
use std::path::{Path, PathBuf};

/// A finalized narration track. Immutable once created.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioTrack {
    path: PathBuf,
    duration_secs: f64,
}

impl AudioTrack {
    /// Describe an existing audio file whose duration is already known.
    pub fn new(path: impl Into<PathBuf>, duration_secs: f64) -> SketchResult<Self> {
        if !duration_secs.is_finite() || duration_secs < 0.0 {
            return Err(SketchError::audio_finalize(format!(
                "invalid audio duration {duration_secs}"
            )));
        }
        Ok(Self {
            path: path.into(),
            duration_secs,
        })
    }

    /// Read a WAV header and derive the track duration from its sample count.
    pub fn from_wav(path: impl Into<PathBuf>) -> SketchResult<Self> {
        let path = path.into();
        let reader = hound::WavReader::open(&path).map_err(|e| {
            SketchError::audio_finalize(format!("failed to read '{}': {e}", path.display()))
        })?;
        let spec = reader.spec();
        if spec.sample_rate == 0 {
            return Err(SketchError::audio_finalize(format!(
                "'{}' has a zero sample rate",
                path.display()
            )));
        }
        let duration_secs = f64::from(reader.duration()) / f64::from(spec.sample_rate);
        Self::new(path, duration_secs)
    }

    /// Location of the audio file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }
}
