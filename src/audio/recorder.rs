use crate::audio::track::AudioTrack;
use crate::foundation::error::{SketchError, SketchResult};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Boundary to the narration recorder owned by the embedding application.
///
/// Hardware capture and permission prompts happen behind this trait; the pipeline only needs a
/// finalized `(file, duration)` pair once recording stops.
pub trait AudioRecorder: Send {
    /// Begin recording into `path`.
    ///
    /// Fails with [`SketchError::AudioConfigurationFailed`] when the session cannot be opened.
    fn start(&mut self, path: &Path) -> SketchResult<()>;

    /// Finish recording and return the finalized track.
    ///
    /// Fails with [`SketchError::AudioFinalizeFailed`] when no usable track was produced.
    fn stop(&mut self) -> SketchResult<AudioTrack>;

    /// Drop an in-progress recording and delete its file. Safe to call when idle.
    fn abort(&mut self);
}

struct ActiveWav {
    writer: hound::WavWriter<BufWriter<std::fs::File>>,
    path: PathBuf,
    write_error: Option<String>,
}

/// Producer handle for [`WavRecorder`], cloned into the capture callback.
#[derive(Clone, Default)]
pub struct WavFeed {
    active: Arc<Mutex<Option<ActiveWav>>>,
}

impl WavFeed {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveWav>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append interleaved samples in `[-1.0, 1.0]`. Ignored while not recording.
    pub fn push(&self, interleaved: &[f32]) {
        let mut guard = self.lock();
        let Some(active) = guard.as_mut() else {
            return;
        };
        if active.write_error.is_some() {
            return;
        }
        for &s in interleaved {
            let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            if let Err(e) = active.writer.write_sample(v) {
                tracing::warn!(error = %e, "narration sample write failed");
                active.write_error = Some(e.to_string());
                return;
            }
        }
    }

    /// Return `true` while a recording is open.
    pub fn is_recording(&self) -> bool {
        self.lock().is_some()
    }
}

/// [`AudioRecorder`] writing 16-bit PCM WAV files through `hound`.
pub struct WavRecorder {
    spec: hound::WavSpec,
    feed: WavFeed,
}

impl WavRecorder {
    /// Create a recorder for interleaved input at `sample_rate` with `channels` channels.
    pub fn new(sample_rate: u32, channels: u16) -> SketchResult<Self> {
        if sample_rate == 0 {
            return Err(SketchError::audio_configuration("sample_rate must be > 0"));
        }
        if channels == 0 {
            return Err(SketchError::audio_configuration("channels must be > 0"));
        }
        Ok(Self {
            spec: hound::WavSpec {
                channels,
                sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
            feed: WavFeed::default(),
        })
    }

    /// Handle used by the capture callback to deliver samples.
    pub fn feed(&self) -> WavFeed {
        self.feed.clone()
    }
}

impl AudioRecorder for WavRecorder {
    fn start(&mut self, path: &Path) -> SketchResult<()> {
        let mut guard = self.feed.lock();
        if guard.is_some() {
            return Err(SketchError::audio_configuration(
                "a narration recording is already in progress",
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SketchError::audio_configuration(format!(
                    "failed to create '{}': {e}",
                    parent.display()
                ))
            })?;
        }
        let writer = hound::WavWriter::create(path, self.spec).map_err(|e| {
            SketchError::audio_configuration(format!(
                "failed to create '{}': {e}",
                path.display()
            ))
        })?;
        *guard = Some(ActiveWav {
            writer,
            path: path.to_path_buf(),
            write_error: None,
        });
        tracing::debug!(path = %path.display(), "narration recording started");
        Ok(())
    }

    fn stop(&mut self) -> SketchResult<AudioTrack> {
        let active = self
            .feed
            .lock()
            .take()
            .ok_or_else(|| SketchError::audio_finalize("no narration recording in progress"))?;
        if let Some(err) = active.write_error {
            return Err(SketchError::audio_finalize(err));
        }
        let path = active.path;
        active
            .writer
            .finalize()
            .map_err(|e| SketchError::audio_finalize(format!("failed to finalize WAV: {e}")))?;
        let track = AudioTrack::from_wav(&path)?;
        tracing::debug!(duration = track.duration_secs(), "narration recording stopped");
        Ok(track)
    }

    fn abort(&mut self) {
        let Some(active) = self.feed.lock().take() else {
            return;
        };
        let path = active.path.clone();
        drop(active);
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove aborted narration");
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/audio/recorder.rs"]
mod tests;
