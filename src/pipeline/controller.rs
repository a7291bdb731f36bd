use crate::audio::recorder::AudioRecorder;
use crate::audio::track::AudioTrack;
use crate::compose::compositor::{
    CancelToken, CompositionRequest, CompositionResult, Compositor, RunReport,
};
use crate::config::PipelineOpts;
use crate::encode::writer::WriterFactory;
use crate::foundation::core::FrameIndex;
use crate::foundation::error::{ErrorKind, SketchError, SketchResult};
use crate::pipeline::progress::ProgressEstimator;
use crate::pipeline::state::PipelineState;
use crate::session::{SessionPaths, remove_file_if_exists};
use crate::store::frame_store::{FrameEvent, FrameHandle, FrameStore};
use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Notifications published to [`PipelineController::subscribe`] receivers.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    /// The pipeline moved between states.
    StateChanged {
        /// Previous state.
        from: PipelineState,
        /// New state.
        to: PipelineState,
    },
    /// A surface update was captured as a frame.
    FrameCaptured {
        /// Assigned ordinal.
        index: FrameIndex,
        /// Capture time in seconds since recording start.
        captured_at: f64,
    },
    /// Estimated composition progress in `[0, 1]`.
    Progress(f64),
    /// A failure the user should hear about.
    Failed {
        /// Stable classification.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
        /// Whether [`PipelineController::retry`] may succeed.
        retryable: bool,
    },
    /// The output was handed to the save collaborator.
    Saved {
        /// Where the saved copy lives.
        output: PathBuf,
    },
    /// The save collaborator was denied access; the output stays in the session directory.
    SavePermissionDenied {
        /// The composed file, still available for export.
        output: PathBuf,
    },
}

/// Hand-off of a finished video to its final destination (a photo library, a share sheet, ...).
pub trait VideoSaver: Send {
    /// Save `output` and return where the saved asset lives.
    ///
    /// Return [`SketchError::SavePermissionDenied`] when the destination refuses write access.
    fn save(&mut self, output: &Path) -> SketchResult<PathBuf>;
}

/// Leaves the composed video in the session directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepInPlace;

impl VideoSaver for KeepInPlace {
    fn save(&mut self, output: &Path) -> SketchResult<PathBuf> {
        Ok(output.to_path_buf())
    }
}

/// Copies the composed video into a directory, outside the session it was made in.
#[derive(Clone, Debug)]
pub struct CopyToDirectory {
    dir: PathBuf,
}

impl CopyToDirectory {
    /// Save into `dir`, which is created when missing.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl VideoSaver for CopyToDirectory {
    fn save(&mut self, output: &Path) -> SketchResult<PathBuf> {
        let name = output
            .file_name()
            .ok_or_else(|| SketchError::validation("output path has no file name"))?;
        let dest = self.dir.join(name);
        let res = std::fs::create_dir_all(&self.dir).and_then(|()| std::fs::copy(output, &dest));
        match res {
            Ok(_) => Ok(dest),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(SketchError::SavePermissionDenied)
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("failed to copy video into '{}'", self.dir.display()))
                .into()),
        }
    }
}

enum Msg {
    Tick {
        generation: u64,
    },
    Composed {
        generation: u64,
        result: SketchResult<CompositionResult>,
    },
}

/// Periodic progress tick, stopped by dropping its sender.
struct Ticker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    fn spawn(interval: Duration, generation: u64, inbox: Sender<Msg>) -> SketchResult<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("sketchreel-progress".to_owned())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                    if inbox.send(Msg::Tick { generation }).is_err() {
                        break;
                    }
                }
            })
            .context("failed to spawn progress ticker")?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("progress ticker panicked");
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One in-flight compositor run.
struct ComposeJob {
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
    ticker: Ticker,
}

impl ComposeJob {
    /// Stop ticking and wait for the compositor thread to return.
    fn join(mut self) {
        self.ticker.stop();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("composition thread panicked");
        }
    }
}

/// State machine sequencing capture, flush, compose and save for one session directory.
///
/// All transitions happen on the thread that owns the controller. Composition and progress ticks
/// run on background threads and post into an inbox, which the owner drains with
/// [`PipelineController::pump`] or [`PipelineController::wait_settled`].
pub struct PipelineController {
    opts: PipelineOpts,
    paths: SessionPaths,
    state: PipelineState,

    store: FrameStore,
    store_events: Receiver<FrameEvent>,
    recorder: Box<dyn AudioRecorder>,
    compositor: Arc<Compositor>,
    saver: Box<dyn VideoSaver>,

    clock: Option<Instant>,
    audio: Option<AudioTrack>,
    output: Option<PathBuf>,
    progress: Option<ProgressEstimator>,

    job: Option<ComposeJob>,
    generation: u64,
    inbox_tx: Sender<Msg>,
    inbox_rx: Receiver<Msg>,
    observers: Vec<Sender<PipelineEvent>>,
}

impl PipelineController {
    /// Create an idle controller. Any previous content of the session directory is deleted.
    pub fn new(
        paths: SessionPaths,
        opts: PipelineOpts,
        recorder: Box<dyn AudioRecorder>,
        writers: Arc<dyn WriterFactory>,
        saver: Box<dyn VideoSaver>,
    ) -> SketchResult<Self> {
        opts.validate()?;
        let store = FrameStore::open(paths.clone(), opts.store.clone())?;
        Self::assemble(paths, opts, store, recorder, writers, saver)
    }

    /// Restore a sealed session (frames plus `narration.wav`) left by an earlier process.
    ///
    /// The controller starts in [`PipelineState::Failed`] so the composition can be re-run with
    /// [`PipelineController::retry`] or discarded with [`PipelineController::cancel`].
    pub fn resume(
        paths: SessionPaths,
        opts: PipelineOpts,
        recorder: Box<dyn AudioRecorder>,
        writers: Arc<dyn WriterFactory>,
        saver: Box<dyn VideoSaver>,
    ) -> SketchResult<Self> {
        opts.validate()?;
        let store = FrameStore::reopen(paths.clone(), opts.store.clone())?;
        let audio = AudioTrack::from_wav(paths.audio())?;
        let mut this = Self::assemble(paths, opts, store, recorder, writers, saver)?;
        this.audio = Some(audio);
        this.state = PipelineState::Failed;
        tracing::info!(frames = this.store.count(), "session resumed");
        Ok(this)
    }

    fn assemble(
        paths: SessionPaths,
        opts: PipelineOpts,
        store: FrameStore,
        recorder: Box<dyn AudioRecorder>,
        writers: Arc<dyn WriterFactory>,
        saver: Box<dyn VideoSaver>,
    ) -> SketchResult<Self> {
        let compositor = Arc::new(Compositor::new(opts.compositor.clone(), writers)?);
        let store_events = store.subscribe();
        let (inbox_tx, inbox_rx) = mpsc::channel();
        Ok(Self {
            opts,
            paths,
            state: PipelineState::Idle,
            store,
            store_events,
            recorder,
            compositor,
            saver,
            clock: None,
            audio: None,
            output: None,
            progress: None,
            job: None,
            generation: 0,
            inbox_tx,
            inbox_rx,
            observers: Vec::new(),
        })
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Session layout.
    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Frames captured in the current cycle.
    pub fn frame_count(&self) -> u32 {
        self.store.count()
    }

    /// Narration of the current cycle, once recording stopped.
    pub fn audio(&self) -> Option<&AudioTrack> {
        self.audio.as_ref()
    }

    /// Saved output of the current cycle, once it reached [`PipelineState::Done`].
    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Estimated composition progress (`0.0` before composing starts).
    pub fn progress(&self) -> f64 {
        self.progress.as_ref().map_or(0.0, ProgressEstimator::value)
    }

    /// Accounting of the most recent compositor run.
    pub fn last_run_report(&self) -> Option<RunReport> {
        self.compositor.last_report()
    }

    /// Receive every subsequent [`PipelineEvent`].
    pub fn subscribe(&mut self) -> Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel();
        self.observers.push(tx);
        rx
    }

    /// Open the narration and start a fresh frame sequence.
    ///
    /// Allowed from `Idle`, `Failed` and `Done`; a previous cycle's frames and output are discarded.
    #[tracing::instrument(skip(self))]
    pub fn start_recording(&mut self) -> SketchResult<()> {
        self.require(PipelineState::Capturing, "start recording")?;

        self.store.clear()?;
        remove_file_if_exists(&self.paths.video())?;
        self.paths.ensure()?;
        self.audio = None;
        self.output = None;
        self.progress = None;

        if let Err(e) = self.recorder.start(&self.paths.audio()) {
            tracing::warn!(error = %e, "narration could not be opened");
            self.set_state(PipelineState::Idle);
            return Err(e);
        }
        self.clock = Some(Instant::now());
        self.set_state(PipelineState::Capturing);
        Ok(())
    }

    /// Capture the drawing surface after an input update.
    ///
    /// Updates outside [`PipelineState::Capturing`] are ignored and return `None`.
    pub fn on_surface_update(
        &mut self,
        raster: image::RgbaImage,
        is_stylus: bool,
    ) -> SketchResult<Option<FrameHandle>> {
        if self.state != PipelineState::Capturing {
            return Ok(None);
        }
        let captured_at = self
            .clock
            .map_or(0.0, |clock| clock.elapsed().as_secs_f64());
        tracing::trace!(is_stylus, captured_at, "surface update");
        self.append_frame_at(raster, captured_at).map(Some)
    }

    /// Capture `raster` with an explicit timestamp (seconds since recording start).
    pub fn append_frame_at(
        &mut self,
        raster: image::RgbaImage,
        captured_at: f64,
    ) -> SketchResult<FrameHandle> {
        if self.state != PipelineState::Capturing {
            return Err(SketchError::InvalidTransition {
                from: self.state,
                action: "append a frame",
            });
        }
        let handle = self.store.append(raster, captured_at)?;
        self.publish(PipelineEvent::FrameCaptured {
            index: handle.index,
            captured_at: handle.captured_at,
        });
        Ok(handle)
    }

    /// Stop recording, wait for the last frame write and start composing.
    ///
    /// Returns an error when the cycle could not reach `Composing`: an audio finalize failure
    /// returns to `Idle`; a frame write failure or empty input ends in `Failed`.
    #[tracing::instrument(skip(self), fields(frames = self.store.count()))]
    pub fn stop_recording(&mut self) -> SketchResult<()> {
        self.require(PipelineState::Flushing, "stop recording")?;
        self.set_state(PipelineState::Flushing);
        self.clock = None;

        let audio = match self.recorder.stop() {
            Ok(audio) => audio,
            Err(e) => {
                tracing::error!(error = %e, "narration could not be finalized");
                self.publish_failure(&e);
                self.discard_cycle()?;
                self.set_state(PipelineState::Idle);
                return Err(e);
            }
        };
        self.audio = Some(audio);

        let flushed = self
            .store
            .wait_all(Some(self.opts.flush_timeout()))
            .and_then(|()| self.store.seal());
        if let Err(e) = flushed {
            return Err(self.fail(e));
        }
        self.drain_store_events();

        self.ensure_composable()?;
        self.start_composition()
    }

    /// Re-run the compositor against the persisted frames of a failed cycle.
    #[tracing::instrument(skip(self))]
    pub fn retry(&mut self) -> SketchResult<()> {
        if self.state != PipelineState::Failed {
            return Err(SketchError::InvalidTransition {
                from: self.state,
                action: "retry",
            });
        }
        self.ensure_composable()?;
        self.start_composition()
    }

    /// Abort whatever is running and return to `Idle`, deleting every persisted frame and any
    /// partial output. Safe to call from any state.
    #[tracing::instrument(skip(self))]
    pub fn cancel(&mut self) -> SketchResult<()> {
        if let Some(job) = self.job.take() {
            job.cancel.cancel();
            job.join();
        }
        if self.state == PipelineState::Capturing {
            self.recorder.abort();
        }
        self.discard_cycle()?;
        self.set_state(PipelineState::Idle);
        Ok(())
    }

    /// Apply every message posted by background work. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        self.drain_store_events();
        let mut handled = 0;
        while let Ok(msg) = self.inbox_rx.try_recv() {
            self.handle(msg);
            handled += 1;
        }
        handled
    }

    /// Pump until the pipeline leaves `Composing` or `timeout` elapses; returns the state reached.
    pub fn wait_settled(&mut self, timeout: Duration) -> PipelineState {
        let deadline = Instant::now() + timeout;
        self.pump();
        while self.state == PipelineState::Composing {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.inbox_rx.recv_timeout(deadline - now) {
                Ok(msg) => self.handle(msg),
                Err(_) => break,
            }
        }
        self.state
    }

    /// Fail with `EmptyInput` before any composition work when there is nothing to compose.
    fn ensure_composable(&mut self) -> SketchResult<()> {
        let reason = match &self.audio {
            _ if self.store.count() == 0 => "no frames were captured",
            None => "no narration to compose with",
            Some(audio) if audio.duration_secs() <= 0.0 => "narration is empty",
            Some(_) => return Ok(()),
        };
        Err(self.fail(SketchError::empty_input(reason)))
    }

    fn start_composition(&mut self) -> SketchResult<()> {
        let Some(audio) = self.audio.clone() else {
            return Err(SketchError::empty_input("no narration to compose with"));
        };
        let estimator = ProgressEstimator::new(audio.duration_secs(), &self.opts.progress)?;

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancelToken::new();
        let req = CompositionRequest {
            reader: self.store.reader(),
            audio,
            output: self.paths.video(),
        };

        let ticker = Ticker::spawn(estimator.tick_interval(), generation, self.inbox_tx.clone())?;
        let compositor = self.compositor.clone();
        let inbox = self.inbox_tx.clone();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("sketchreel-compose".to_owned())
            .spawn(move || {
                let result = compositor.run(&req, &token);
                let _ = inbox.send(Msg::Composed { generation, result });
            })
            .context("failed to spawn composition thread")?;

        self.job = Some(ComposeJob {
            cancel,
            handle: Some(handle),
            ticker,
        });
        self.progress = Some(estimator);
        self.set_state(PipelineState::Composing);
        self.publish(PipelineEvent::Progress(0.0));
        Ok(())
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Tick { generation } => {
                if generation != self.generation || self.state != PipelineState::Composing {
                    return;
                }
                if let Some(value) = self.progress.as_mut().map(ProgressEstimator::tick) {
                    self.publish(PipelineEvent::Progress(value));
                }
            }
            Msg::Composed { generation, result } => {
                if generation != self.generation || self.state != PipelineState::Composing {
                    tracing::debug!(generation, "dropping stale composition result");
                    return;
                }
                if let Some(job) = self.job.take() {
                    job.join();
                }
                match result {
                    Ok(res) => self.finish_composition(res),
                    Err(e) => {
                        self.fail(e);
                    }
                }
            }
        }
    }

    fn finish_composition(&mut self, res: CompositionResult) {
        if let Some(value) = self.progress.as_mut().map(ProgressEstimator::complete) {
            self.publish(PipelineEvent::Progress(value));
        }
        self.set_state(PipelineState::Saving);

        match self.saver.save(&res.output) {
            Ok(saved) => {
                tracing::info!(output = %saved.display(), "video saved");
                self.output = Some(saved.clone());
                self.publish(PipelineEvent::Saved { output: saved });
                self.set_state(PipelineState::Done);
            }
            Err(SketchError::SavePermissionDenied) => {
                tracing::warn!("save permission denied; keeping output in session directory");
                self.output = Some(res.output.clone());
                self.publish(PipelineEvent::SavePermissionDenied { output: res.output });
                self.set_state(PipelineState::Done);
            }
            Err(e) => {
                self.fail(e);
            }
        }
    }

    /// Report `err`, move to `Failed` and hand the error back for the caller to return.
    fn fail(&mut self, err: SketchError) -> SketchError {
        tracing::error!(error = %err, retryable = err.is_retryable(), "pipeline failed");
        self.publish_failure(&err);
        self.set_state(PipelineState::Failed);
        err
    }

    fn publish_failure(&mut self, err: &SketchError) {
        self.publish(PipelineEvent::Failed {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        });
    }

    fn discard_cycle(&mut self) -> SketchResult<()> {
        while self.inbox_rx.try_recv().is_ok() {}
        self.store.clear()?;
        self.drain_store_events();
        remove_file_if_exists(&self.paths.video())?;
        self.clock = None;
        self.audio = None;
        self.output = None;
        self.progress = None;
        Ok(())
    }

    /// Surface background write failures while capturing; later ones are reported by the flush.
    fn drain_store_events(&mut self) {
        while let Ok(ev) = self.store_events.try_recv() {
            if self.state != PipelineState::Capturing {
                continue;
            }
            if let FrameEvent::WriteFailed { index, reason } = ev {
                let err = SketchError::frame_write(index, reason);
                self.publish_failure(&err);
            }
        }
    }

    fn require(&self, to: PipelineState, action: &'static str) -> SketchResult<()> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(SketchError::InvalidTransition {
                from: self.state,
                action,
            })
        }
    }

    fn set_state(&mut self, to: PipelineState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!(%from, %to, "pipeline state changed");
        self.publish(PipelineEvent::StateChanged { from, to });
    }

    fn publish(&mut self, ev: PipelineEvent) {
        self.observers.retain(|tx| tx.send(ev.clone()).is_ok());
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            job.cancel.cancel();
            job.join();
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/pipeline/controller.rs"]
mod tests;
