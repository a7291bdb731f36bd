use crate::compose::pool::PixelBuffer;
use crate::foundation::core::{Canvas, Fps};
use crate::foundation::error::{SketchError, SketchResult};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Configuration provided to a [`VideoWriter`] when a composition run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    /// Buffer size of every appended frame.
    pub canvas: Canvas,
    /// Output frame rate.
    pub fps: Fps,
    /// Narration to mux into the output, if any.
    pub audio: Option<PathBuf>,
    /// Output file.
    pub out_path: PathBuf,
}

/// One writer session, owned by exactly one compositor run.
///
/// Ordering contract: `append` is called with non-decreasing presentation times, from a single
/// thread, and each call returns before the next buffer is handed over. `finish` or `abort` is
/// called exactly once after a successful `begin`.
pub trait VideoWriter: Send {
    /// Open the output.
    fn begin(&mut self, cfg: WriterConfig) -> SketchResult<()>;
    /// Submit one frame, shown from `presentation_secs` until the next frame's time.
    fn append(&mut self, frame: &PixelBuffer, presentation_secs: f64) -> SketchResult<()>;
    /// Close the session so the output lasts exactly `end_secs`.
    fn finish(&mut self, end_secs: f64) -> SketchResult<()>;
    /// Tear the session down without producing output. Must be safe after a failed call.
    fn abort(&mut self);
}

/// Creates a fresh [`VideoWriter`] for every compositor run.
pub trait WriterFactory: Send + Sync {
    /// Build an unopened writer.
    fn create(&self) -> Box<dyn VideoWriter>;
}

impl<F> WriterFactory for F
where
    F: Fn() -> Box<dyn VideoWriter> + Send + Sync,
{
    fn create(&self) -> Box<dyn VideoWriter> {
        self()
    }
}

/// Everything an [`InMemoryWriter`] received.
#[derive(Debug, Default, Clone)]
pub struct WriterLog {
    /// Configuration captured in `begin`.
    pub config: Option<WriterConfig>,
    /// `(presentation_secs, pixels)` per appended frame, in order.
    pub frames: Vec<(f64, Vec<u8>)>,
    /// End time passed to `finish`.
    pub finished_at: Option<f64>,
    /// Whether `abort` was called.
    pub aborted: bool,
}

/// Writer that keeps every frame in memory, for tests and debugging.
///
/// Clones share the same [`WriterLog`].
#[derive(Debug, Default, Clone)]
pub struct InMemoryWriter {
    log: Arc<Mutex<WriterLog>>,
}

impl InMemoryWriter {
    /// Create a new in-memory writer.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WriterLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of what the writer has received so far.
    pub fn log(&self) -> WriterLog {
        self.lock().clone()
    }

    /// Presentation times of the appended frames.
    pub fn presentation_times(&self) -> Vec<f64> {
        self.lock().frames.iter().map(|(t, _)| *t).collect()
    }
}

impl VideoWriter for InMemoryWriter {
    fn begin(&mut self, cfg: WriterConfig) -> SketchResult<()> {
        let mut log = self.lock();
        *log = WriterLog {
            config: Some(cfg),
            ..WriterLog::default()
        };
        Ok(())
    }

    fn append(&mut self, frame: &PixelBuffer, presentation_secs: f64) -> SketchResult<()> {
        let mut log = self.lock();
        if log.config.is_none() {
            return Err(SketchError::encoder_write("writer not started"));
        }
        if let Some((last, _)) = log.frames.last()
            && presentation_secs < *last
        {
            return Err(SketchError::encoder_write(
                "presentation time went backwards",
            ));
        }
        log.frames.push((presentation_secs, frame.data.clone()));
        Ok(())
    }

    fn finish(&mut self, end_secs: f64) -> SketchResult<()> {
        let mut log = self.lock();
        if log.config.is_none() {
            return Err(SketchError::encoder_finalize("writer not started"));
        }
        log.finished_at = Some(end_secs);
        Ok(())
    }

    fn abort(&mut self) {
        self.lock().aborted = true;
    }
}
