use crate::audio::track::AudioTrack;
use crate::compose::pool::{BufferPool, BufferPoolOpts, PixelFormat, PoolStats, PooledBuffer};
use crate::compose::raster::{OutputGeometry, rasterize_into};
use crate::encode::writer::{VideoWriter, WriterConfig, WriterFactory};
use crate::foundation::core::{Canvas, Fps, FrameIndex};
use crate::foundation::error::{ErrorKind, SketchError, SketchResult};
use crate::session::remove_file_if_exists;
use crate::store::frame_store::FrameReader;
use crate::timeline::Timeline;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

/// Options for [`Compositor`].
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CompositorOpts {
    /// Encoder dimension alignment in pixels.
    pub alignment: u32,
    /// Constant output frame rate handed to the writer.
    pub fps: Fps,
    /// Background shown outside the drawn content (RGBA8; alpha is ignored).
    pub bg_rgba: [u8; 4],
    /// Number of pixel buffers a run may hold at once.
    pub pool_capacity: usize,
    /// Buffers that may wait for the encoder thread before the producer blocks.
    pub writer_queue_depth: usize,
    /// Upper bound for one buffer acquisition attempt.
    pub acquire_timeout_ms: u64,
    /// Acquisition attempts per frame before the run fails.
    pub max_acquire_attempts: u32,
    /// Upper bound for waiting on a frame's durable write.
    pub frame_wait_timeout_ms: u64,
}

impl Default for CompositorOpts {
    fn default() -> Self {
        Self {
            alignment: 16,
            fps: Fps::default(),
            bg_rgba: [0, 0, 0, 255],
            pool_capacity: 3,
            writer_queue_depth: 1,
            acquire_timeout_ms: 2_000,
            max_acquire_attempts: 3,
            frame_wait_timeout_ms: 10_000,
        }
    }
}

impl CompositorOpts {
    /// Reject zero-valued limits and an invalid frame rate.
    pub fn validate(&self) -> SketchResult<()> {
        self.fps.validate()?;
        if self.alignment == 0 {
            return Err(SketchError::validation("alignment must be > 0"));
        }
        if self.pool_capacity == 0 {
            return Err(SketchError::validation("pool_capacity must be > 0"));
        }
        if self.writer_queue_depth == 0 {
            return Err(SketchError::validation("writer_queue_depth must be > 0"));
        }
        if self.acquire_timeout_ms == 0 || self.max_acquire_attempts == 0 {
            return Err(SketchError::validation(
                "acquire_timeout_ms and max_acquire_attempts must be > 0",
            ));
        }
        if self.frame_wait_timeout_ms == 0 {
            return Err(SketchError::validation("frame_wait_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

/// Cloneable cancellation flag shared between a run and whoever may abort it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Return `true` once [`CancelToken::cancel`] was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Inputs of one composition run.
#[derive(Clone)]
pub struct CompositionRequest {
    /// Frames to compose, in index order.
    pub reader: FrameReader,
    /// Finalized narration; its duration is the output duration.
    pub audio: AudioTrack,
    /// Output video file.
    pub output: PathBuf,
}

/// A finished output asset.
#[derive(Clone, Debug, PartialEq)]
pub struct CompositionResult {
    /// Output video file.
    pub output: PathBuf,
    /// Frames written to the output.
    pub frame_count: u32,
    /// Output duration in seconds (the narration length).
    pub duration_secs: f64,
    /// Encoder-facing raster size.
    pub canvas: Canvas,
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The output was finalized.
    Completed,
    /// The run failed with the given error kind.
    Failed(ErrorKind),
    /// The run was cancelled.
    Cancelled,
}

/// Resource accounting for the most recent run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunReport {
    /// Buffers the writer accepted.
    pub frames_submitted: u32,
    /// Pool counters at the end of the run (all zero when no pool was created).
    pub pool: PoolStats,
    /// Buffers still checked out once the run returned. Anything but zero is a leak.
    pub outstanding_at_exit: usize,
    /// How the run ended.
    pub outcome: RunOutcome,
}

/// Video assembly engine: frames + narration in, one timed video file out.
///
/// Every run owns a fresh buffer pool and a fresh writer from the factory. Frames are decoded and
/// rasterized on the calling thread and handed to a dedicated encoder thread over a bounded
/// channel; the producer blocks whenever the writer falls behind.
pub struct Compositor {
    opts: CompositorOpts,
    factory: Arc<dyn WriterFactory>,
    last_report: Mutex<Option<RunReport>>,
}

impl Compositor {
    /// Create a compositor that opens writers through `factory`.
    pub fn new(opts: CompositorOpts, factory: Arc<dyn WriterFactory>) -> SketchResult<Self> {
        opts.validate()?;
        Ok(Self {
            opts,
            factory,
            last_report: Mutex::new(None),
        })
    }

    /// Accounting of the most recent [`Compositor::run`], if any.
    pub fn last_report(&self) -> Option<RunReport> {
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Compose `req` into its output file.
    ///
    /// Fails with [`SketchError::EmptyInput`] before touching the pool when there are no frames or
    /// the narration is empty. On failure or cancellation the writer is aborted and no output file
    /// is left behind.
    #[tracing::instrument(
        skip_all,
        fields(frames = req.reader.count(), audio_secs = req.audio.duration_secs())
    )]
    pub fn run(
        &self,
        req: &CompositionRequest,
        cancel: &CancelToken,
    ) -> SketchResult<CompositionResult> {
        let mut report = RunReport {
            frames_submitted: 0,
            pool: PoolStats::default(),
            outstanding_at_exit: 0,
            outcome: RunOutcome::Completed,
        };
        let res = self.run_inner(req, cancel, &mut report);
        report.outcome = match &res {
            Ok(_) => RunOutcome::Completed,
            Err(SketchError::Cancelled) => RunOutcome::Cancelled,
            Err(e) => RunOutcome::Failed(e.kind()),
        };

        match &res {
            Ok(out) => tracing::info!(
                frames = out.frame_count,
                width = out.canvas.width,
                height = out.canvas.height,
                waits = report.pool.waits,
                "composition finished"
            ),
            Err(SketchError::Cancelled) => tracing::info!("composition cancelled"),
            Err(e) => tracing::error!(error = %e, "composition failed"),
        }
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
        res
    }

    fn run_inner(
        &self,
        req: &CompositionRequest,
        cancel: &CancelToken,
        report: &mut RunReport,
    ) -> SketchResult<CompositionResult> {
        let timeline = Timeline::build(req.reader.timestamps(), req.audio.duration_secs())?;
        let frame_wait = Duration::from_millis(self.opts.frame_wait_timeout_ms);
        if cancel.is_cancelled() {
            return Err(SketchError::Cancelled);
        }

        let first = req.reader.frame(FrameIndex::FIRST, Some(frame_wait))?;
        let (w, h) = first.payload.dimensions();
        let geom = OutputGeometry::for_source(
            Canvas {
                width: w,
                height: h,
            },
            self.opts.alignment,
        )?;
        if !geom.is_aligned() {
            tracing::debug!(
                source_w = w,
                source_h = h,
                canvas_w = geom.canvas.width,
                canvas_h = geom.canvas.height,
                "source size is not aligned; padding with background"
            );
        }

        let pool = BufferPool::new(BufferPoolOpts {
            canvas: geom.canvas,
            format: PixelFormat::Rgba8,
            capacity: self.opts.pool_capacity,
        })?;

        let mut session = WriterSession::open(
            self.factory.create(),
            WriterConfig {
                canvas: geom.canvas,
                fps: self.opts.fps,
                audio: Some(req.audio.path().to_path_buf()),
                out_path: req.output.clone(),
            },
        )?;

        let bg = self.opts.bg_rgba;
        let cap = self.opts.writer_queue_depth;
        let writer_ref: &mut dyn VideoWriter = session.writer.as_mut();

        let (produce_res, enc_res) = std::thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel::<FrameMsg>(cap);

            let enc = scope.spawn(move || -> SketchResult<u32> {
                let mut submitted = 0u32;
                for msg in rx {
                    writer_ref.append(&msg.buffer, msg.presentation_secs)?;
                    submitted += 1;
                    tracing::debug!(
                        frame = msg.index.get(),
                        pts = msg.presentation_secs,
                        "frame submitted"
                    );
                    // `msg.buffer` goes back to the pool here.
                }
                Ok(submitted)
            });

            let produce_res = (|| -> SketchResult<()> {
                let mut first = Some(first);
                for iv in timeline.intervals() {
                    if cancel.is_cancelled() {
                        return Err(SketchError::Cancelled);
                    }
                    let mut buffer = self.acquire_buffer(&pool, cancel, iv.index)?;
                    let frame = match first.take() {
                        Some(f) => f,
                        None => req.reader.frame(iv.index, Some(frame_wait))?,
                    };
                    rasterize_into(&mut buffer, &frame.payload, &geom, bg)?;
                    drop(frame);

                    tx.send(FrameMsg {
                        index: iv.index,
                        presentation_secs: iv.start,
                        buffer,
                    })
                    .map_err(|_| {
                        SketchError::encoder_write("encoder thread is not accepting frames")
                    })?;
                }
                Ok(())
            })();

            drop(tx);
            let enc_res = enc
                .join()
                .unwrap_or_else(|_| Err(SketchError::encoder_write("encoder thread panicked")));
            (produce_res, enc_res)
        });

        report.pool = pool.stats();
        report.outstanding_at_exit = pool.outstanding();

        // The encoder's own error explains a producer that found the channel closed.
        let submitted = enc_res?;
        report.frames_submitted = submitted;
        produce_res?;
        if cancel.is_cancelled() {
            return Err(SketchError::Cancelled);
        }

        let duration_secs = timeline.total_secs();
        session.finish(duration_secs)?;

        Ok(CompositionResult {
            output: req.output.clone(),
            frame_count: submitted,
            duration_secs,
            canvas: geom.canvas,
        })
    }

    fn acquire_buffer(
        &self,
        pool: &BufferPool,
        cancel: &CancelToken,
        index: FrameIndex,
    ) -> SketchResult<PooledBuffer> {
        let timeout = Duration::from_millis(self.opts.acquire_timeout_ms);
        let attempts = self.opts.max_acquire_attempts;
        let mut last_err = None;
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SketchError::Cancelled);
            }
            match pool.acquire(timeout) {
                Ok(buf) => return Ok(buf),
                Err(e) => {
                    tracing::warn!(
                        frame = index.get(),
                        attempt,
                        attempts,
                        error = %e,
                        "pixel buffer acquisition failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(SketchError::encoder_write(format!(
            "no pixel buffer for frame {index} after {attempts} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

struct FrameMsg {
    index: FrameIndex,
    presentation_secs: f64,
    buffer: PooledBuffer,
}

/// Writer owned by one run. Dropping it without [`WriterSession::finish`] aborts the writer and
/// removes the partial output.
struct WriterSession {
    writer: Box<dyn VideoWriter>,
    out_path: PathBuf,
    open: bool,
}

impl WriterSession {
    fn open(mut writer: Box<dyn VideoWriter>, cfg: WriterConfig) -> SketchResult<Self> {
        let out_path = cfg.out_path.clone();
        if let Err(e) = writer.begin(cfg) {
            writer.abort();
            discard_output(&out_path);
            return Err(e);
        }
        Ok(Self {
            writer,
            out_path,
            open: true,
        })
    }

    fn finish(&mut self, end_secs: f64) -> SketchResult<()> {
        self.writer.finish(end_secs)?;
        self.open = false;
        Ok(())
    }
}

impl Drop for WriterSession {
    fn drop(&mut self) {
        if self.open {
            self.writer.abort();
            discard_output(&self.out_path);
        }
    }
}

fn discard_output(path: &Path) {
    if let Err(e) = remove_file_if_exists(path) {
        tracing::warn!(error = %e, "failed to remove partial output");
    }
}

#[cfg(test)]
#[path = "../../tests/unit/compose/compositor.rs"]
mod tests;
