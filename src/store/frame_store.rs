use crate::foundation::core::FrameIndex;
use crate::foundation::error::{SketchError, SketchResult};
use crate::foundation::math::blend_over_opaque;
use crate::session::SessionPaths;
use crate::store::tracker::WriteTracker;
use anyhow::Context as _;
use image::ImageEncoder as _;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const MANIFEST_VERSION: u32 = 1;

/// Options for [`FrameStore`].
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FrameStoreOpts {
    /// JPEG quality (1..=100) used for durable frames. Lower trades fidelity for storage.
    pub jpeg_quality: u8,
    /// Maximum number of captured payloads waiting for the I/O worker.
    pub write_queue_depth: usize,
    /// Background used to flatten alpha before encoding (RGBA8, straight alpha).
    pub flatten_rgba: [u8; 4],
}

impl Default for FrameStoreOpts {
    fn default() -> Self {
        Self {
            jpeg_quality: 70,
            write_queue_depth: 8,
            flatten_rgba: [255, 255, 255, 255],
        }
    }
}

impl FrameStoreOpts {
    /// Reject out-of-range values.
    pub fn validate(&self) -> SketchResult<()> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(SketchError::validation("jpeg_quality must be in 1..=100"));
        }
        if self.write_queue_depth == 0 {
            return Err(SketchError::validation("write_queue_depth must be > 0"));
        }
        Ok(())
    }
}

/// A persisted frame read back from storage.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Session ordinal.
    pub index: FrameIndex,
    /// Capture time in seconds since recording start.
    pub captured_at: f64,
    /// Decoded raster (straight-alpha RGBA8).
    pub payload: image::RgbaImage,
}

/// Returned by [`FrameStore::append`]; the index is assigned before the durable write lands.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameHandle {
    /// Assigned ordinal.
    pub index: FrameIndex,
    /// Capture time in seconds since recording start.
    pub captured_at: f64,
}

/// Notifications published to [`FrameStore::subscribe`] receivers.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameEvent {
    /// A frame was accepted and queued for writing.
    Appended {
        /// Assigned ordinal.
        index: FrameIndex,
        /// Capture time in seconds.
        captured_at: f64,
    },
    /// A frame's durable write completed.
    Persisted {
        /// Persisted ordinal.
        index: FrameIndex,
    },
    /// A frame's durable write failed. No later frame of the session will be written.
    WriteFailed {
        /// Failed ordinal.
        index: FrameIndex,
        /// Failure description.
        reason: String,
    },
    /// Every frame was deleted and the counter reset.
    Cleared,
}

#[derive(Default)]
struct Observers(Mutex<Vec<Sender<FrameEvent>>>);

impl Observers {
    fn subscribe(&self) -> Receiver<FrameEvent> {
        let (tx, rx) = mpsc::channel();
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    fn publish(&self, ev: FrameEvent) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(ev.clone()).is_ok());
    }
}

struct WriteJob {
    index: FrameIndex,
    payload: image::RgbaImage,
}

/// Background writer owning the only path through which frames reach storage.
struct IoWorker {
    tx: Option<SyncSender<WriteJob>>,
    handle: Option<JoinHandle<()>>,
    discard: Arc<AtomicBool>,
}

impl IoWorker {
    fn spawn(
        paths: SessionPaths,
        opts: FrameStoreOpts,
        tracker: Arc<WriteTracker>,
        observers: Arc<Observers>,
    ) -> SketchResult<Self> {
        let (tx, rx) = mpsc::sync_channel::<WriteJob>(opts.write_queue_depth);
        let discard = Arc::new(AtomicBool::new(false));
        let discard_worker = discard.clone();
        let handle = std::thread::Builder::new()
            .name("sketchreel-frame-io".to_owned())
            .spawn(move || {
                for job in rx {
                    if discard_worker.load(Ordering::Acquire) || tracker.failure().is_some() {
                        continue;
                    }
                    match persist_frame(&paths, job.index, &job.payload, &opts) {
                        Ok(()) => {
                            // Subscribers see the event before waiters are released.
                            observers.publish(FrameEvent::Persisted { index: job.index });
                            tracker.mark_persisted(job.index);
                            tracing::debug!(index = job.index.get(), "frame persisted");
                        }
                        Err(e) => {
                            let reason = format!("{e:#}");
                            tracing::error!(index = job.index.get(), %reason, "frame write failed");
                            observers.publish(FrameEvent::WriteFailed {
                                index: job.index,
                                reason: reason.clone(),
                            });
                            tracker.mark_failed(job.index, reason);
                        }
                    }
                    // `job.payload` is released here, right after the durable write.
                }
            })
            .context("failed to spawn frame I/O worker")?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            discard,
        })
    }

    fn submit(&self, job: WriteJob) -> Result<(), WriteJob> {
        match self.tx.as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Stop accepting jobs and join the worker. With `discard`, queued jobs are dropped unwritten.
    fn shutdown(&mut self, discard: bool) {
        if discard {
            self.discard.store(true, Ordering::Release);
        }
        drop(self.tx.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("frame I/O worker panicked");
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct FrameManifest {
    version: u32,
    timestamps: Vec<f64>,
}

/// Append-only, index-addressed persistence of captured frames.
///
/// `append` assigns the next ordinal synchronously and hands the payload to a dedicated I/O
/// worker, which encodes it as JPEG, renames it into place and drops the in-memory raster. Readers
/// wait on a completion signal instead of probing the filesystem.
pub struct FrameStore {
    paths: SessionPaths,
    opts: FrameStoreOpts,
    timestamps: Vec<f64>,
    tracker: Arc<WriteTracker>,
    observers: Arc<Observers>,
    worker: IoWorker,
}

impl FrameStore {
    /// Open a fresh, empty store. Any previous content of the session directory is deleted.
    pub fn open(paths: SessionPaths, opts: FrameStoreOpts) -> SketchResult<Self> {
        opts.validate()?;
        paths.remove_all()?;
        paths.ensure()?;
        Self::with_state(paths, opts, Vec::new(), WriteTracker::new())
    }

    /// Reopen a session sealed with [`FrameStore::seal`], keeping its frames and timestamps.
    pub fn reopen(paths: SessionPaths, opts: FrameStoreOpts) -> SketchResult<Self> {
        opts.validate()?;
        let manifest_path = paths.manifest();
        let bytes = std::fs::read(&manifest_path)
            .with_context(|| format!("failed to read '{}'", manifest_path.display()))?;
        let manifest: FrameManifest = serde_json::from_slice(&bytes)
            .map_err(|e| SketchError::validation(format!("invalid frame manifest: {e}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(SketchError::validation(format!(
                "unsupported frame manifest version {}",
                manifest.version
            )));
        }

        let count = u32::try_from(manifest.timestamps.len())
            .map_err(|_| SketchError::validation("frame manifest is too large"))?;
        for i in 1..=count {
            if !paths.frame(FrameIndex(i)).is_file() {
                return Err(SketchError::FrameNotFound(FrameIndex(i)));
            }
        }

        tracing::info!(root = %paths.root().display(), count, "reopened frame store");
        Self::with_state(
            paths,
            opts,
            manifest.timestamps,
            WriteTracker::persisted_through(count),
        )
    }

    fn with_state(
        paths: SessionPaths,
        opts: FrameStoreOpts,
        timestamps: Vec<f64>,
        tracker: WriteTracker,
    ) -> SketchResult<Self> {
        let tracker = Arc::new(tracker);
        let observers = Arc::new(Observers::default());
        let worker = IoWorker::spawn(
            paths.clone(),
            opts.clone(),
            tracker.clone(),
            observers.clone(),
        )?;
        Ok(Self {
            paths,
            opts,
            timestamps,
            tracker,
            observers,
            worker,
        })
    }

    /// Session layout backing this store.
    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Queue `payload` for durable storage and return its ordinal.
    ///
    /// Blocks while `write_queue_depth` payloads are already waiting for the I/O worker.
    pub fn append(
        &mut self,
        payload: image::RgbaImage,
        captured_at: f64,
    ) -> SketchResult<FrameHandle> {
        if !captured_at.is_finite() || captured_at < 0.0 {
            return Err(SketchError::validation(
                "frame timestamp must be finite and non-negative",
            ));
        }
        if payload.width() == 0 || payload.height() == 0 {
            return Err(SketchError::validation("frame payload must be non-empty"));
        }
        if let Some(err) = self.tracker.failure() {
            return Err(err);
        }

        let count = u32::try_from(self.timestamps.len())
            .map_err(|_| SketchError::validation("frame count overflow"))?;
        let index = FrameIndex(count + 1);
        if self.worker.submit(WriteJob { index, payload }).is_err() {
            return Err(SketchError::frame_write(index, "frame I/O worker is not running"));
        }
        self.timestamps.push(captured_at);

        self.observers
            .publish(FrameEvent::Appended { index, captured_at });
        tracing::debug!(index = index.get(), captured_at, "frame appended");
        Ok(FrameHandle { index, captured_at })
    }

    /// Number of appended frames (persisted or still in flight).
    pub fn count(&self) -> u32 {
        self.timestamps.len() as u32
    }

    /// Capture timestamps in index order.
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Read back frame `index`, waiting for its durable write to complete first.
    pub fn frame(&self, index: FrameIndex) -> SketchResult<Frame> {
        self.reader().frame(index, None)
    }

    /// Block until frame `index` is durable (or its write, or an earlier one, failed).
    pub fn wait_persisted(&self, index: FrameIndex, timeout: Option<Duration>) -> SketchResult<()> {
        if index.get() == 0 || index.get() > self.count() {
            return Err(SketchError::FrameNotFound(index));
        }
        self.tracker.wait_for(index, timeout)
    }

    /// Block until every appended frame is durable. Trivially succeeds for an empty store.
    pub fn wait_all(&self, timeout: Option<Duration>) -> SketchResult<()> {
        match self.count() {
            0 => Ok(()),
            n => self.tracker.wait_for(FrameIndex(n), timeout),
        }
    }

    /// Receive [`FrameEvent`]s for every subsequent append, write and clear.
    pub fn subscribe(&self) -> Receiver<FrameEvent> {
        self.observers.subscribe()
    }

    /// Write the frame manifest so the session can be reopened later.
    ///
    /// Every appended frame must already be durable.
    pub fn seal(&self) -> SketchResult<()> {
        if let Some(err) = self.tracker.failure() {
            return Err(err);
        }
        if self.tracker.durable_through() < self.count() {
            return Err(SketchError::validation(
                "cannot seal frame store while writes are still in flight",
            ));
        }

        let manifest = FrameManifest {
            version: MANIFEST_VERSION,
            timestamps: self.timestamps.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| SketchError::validation(format!("manifest serialization failed: {e}")))?;
        let path = self.paths.manifest();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write '{}'", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move manifest into '{}'", path.display()))?;
        tracing::debug!(count = self.count(), "frame store sealed");
        Ok(())
    }

    /// Cheap read-only view handed to the compositor.
    pub fn reader(&self) -> FrameReader {
        FrameReader {
            paths: self.paths.clone(),
            timestamps: Arc::from(self.timestamps.as_slice()),
            tracker: self.tracker.clone(),
        }
    }

    /// Delete every persisted frame and the session directory, and reset the counter.
    ///
    /// Writes still queued are dropped unwritten. The store stays usable afterwards.
    pub fn clear(&mut self) -> SketchResult<()> {
        self.worker.shutdown(true);
        self.paths.remove_all()?;
        self.timestamps.clear();
        // Readers handed out before the clear keep the old tracker and never observe new writes.
        self.tracker = Arc::new(WriteTracker::new());
        self.worker = IoWorker::spawn(
            self.paths.clone(),
            self.opts.clone(),
            self.tracker.clone(),
            self.observers.clone(),
        )?;
        self.observers.publish(FrameEvent::Cleared);
        tracing::info!(root = %self.paths.root().display(), "frame store cleared");
        Ok(())
    }
}

/// Read-only view of a [`FrameStore`] at the moment it was taken.
#[derive(Clone)]
pub struct FrameReader {
    paths: SessionPaths,
    timestamps: Arc<[f64]>,
    tracker: Arc<WriteTracker>,
}

impl FrameReader {
    /// Number of frames visible to this reader.
    pub fn count(&self) -> u32 {
        self.timestamps.len() as u32
    }

    /// Capture timestamps in index order.
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Block until every frame visible to this reader is durable.
    pub fn wait_all(&self, timeout: Option<Duration>) -> SketchResult<()> {
        match self.count() {
            0 => Ok(()),
            n => self.tracker.wait_for(FrameIndex(n), timeout),
        }
    }

    /// Decode frame `index` once its durable write has completed.
    pub fn frame(&self, index: FrameIndex, timeout: Option<Duration>) -> SketchResult<Frame> {
        if index.get() == 0 || index.get() > self.count() {
            return Err(SketchError::FrameNotFound(index));
        }
        self.tracker.wait_for(index, timeout)?;

        let path = self.paths.frame(index);
        let payload = image::open(&path)
            .with_context(|| format!("failed to decode frame '{}'", path.display()))?
            .to_rgba8();
        Ok(Frame {
            index,
            captured_at: self.timestamps[index.slot()],
            payload,
        })
    }
}

fn persist_frame(
    paths: &SessionPaths,
    index: FrameIndex,
    payload: &image::RgbaImage,
    opts: &FrameStoreOpts,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(paths.root())
        .with_context(|| format!("failed to create '{}'", paths.root().display()))?;

    let bg = opts.flatten_rgba;
    let rgb = image::RgbImage::from_fn(payload.width(), payload.height(), |x, y| {
        let [r, g, b, _] = blend_over_opaque(payload.get_pixel(x, y).0, bg);
        image::Rgb([r, g, b])
    });

    let path = paths.frame(index);
    let tmp = path.with_extension("jpg.tmp");
    let file = std::fs::File::create(&tmp)
        .with_context(|| format!("failed to create '{}'", tmp.display()))?;
    let mut out = std::io::BufWriter::new(file);
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, opts.jpeg_quality)
        .write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .with_context(|| format!("failed to encode frame {index}"))?;
    out.flush()
        .with_context(|| format!("failed to flush '{}'", tmp.display()))?;
    drop(out);

    std::fs::rename(&tmp, &path)
        .with_context(|| format!("failed to move frame into '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
#[path = "../../tests/unit/store/frame_store.rs"]
mod tests;
