use super::*;
use crate::compose::compositor::RunOutcome;
use crate::compose::pool::PixelBuffer;
use crate::encode::writer::{InMemoryWriter, VideoWriter, WriterConfig};
use std::sync::atomic::{AtomicBool, Ordering};

fn temp_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "sketchreel_pipeline_{tag}_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    ))
}

fn solid(rgba: [u8; 4]) -> image::RgbaImage {
    image::RgbaImage::from_pixel(24, 16, image::Rgba(rgba))
}

/// Recorder reporting a fixed duration without touching audio hardware.
struct FixedRecorder {
    duration: f64,
    fail_start: bool,
    fail_stop: bool,
    aborted: Arc<AtomicBool>,
    path: Option<PathBuf>,
}

impl FixedRecorder {
    fn new(duration: f64) -> Self {
        Self {
            duration,
            fail_start: false,
            fail_stop: false,
            aborted: Arc::new(AtomicBool::new(false)),
            path: None,
        }
    }
}

impl AudioRecorder for FixedRecorder {
    fn start(&mut self, path: &Path) -> SketchResult<()> {
        if self.fail_start {
            return Err(SketchError::audio_configuration("microphone unavailable"));
        }
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    fn stop(&mut self) -> SketchResult<AudioTrack> {
        let path = self
            .path
            .take()
            .ok_or_else(|| SketchError::audio_finalize("not recording"))?;
        if self.fail_stop {
            return Err(SketchError::audio_finalize("recorder interrupted"));
        }
        AudioTrack::new(path, self.duration)
    }

    fn abort(&mut self) {
        self.path = None;
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Appends slowly and fails while `fail` is set.
#[derive(Clone, Default)]
struct TestWriter {
    inner: InMemoryWriter,
    fail: Arc<AtomicBool>,
    delay: Duration,
}

impl VideoWriter for TestWriter {
    fn begin(&mut self, cfg: WriterConfig) -> SketchResult<()> {
        self.inner.begin(cfg)
    }
    fn append(&mut self, frame: &PixelBuffer, presentation_secs: f64) -> SketchResult<()> {
        std::thread::sleep(self.delay);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SketchError::encoder_write("encoder rejected frame"));
        }
        self.inner.append(frame, presentation_secs)
    }
    fn finish(&mut self, end_secs: f64) -> SketchResult<()> {
        self.inner.finish(end_secs)
    }
    fn abort(&mut self) {
        self.inner.abort()
    }
}

struct DenyingSaver;

impl VideoSaver for DenyingSaver {
    fn save(&mut self, _output: &Path) -> SketchResult<PathBuf> {
        Err(SketchError::SavePermissionDenied)
    }
}

struct BrokenSaver;

impl VideoSaver for BrokenSaver {
    fn save(&mut self, _output: &Path) -> SketchResult<PathBuf> {
        Err(SketchError::Other(anyhow::anyhow!("library unavailable")))
    }
}

fn controller(
    root: &Path,
    recorder: FixedRecorder,
    writer: &TestWriter,
    saver: Box<dyn VideoSaver>,
) -> PipelineController {
    let w = writer.clone();
    let factory: Arc<dyn WriterFactory> =
        Arc::new(move || -> Box<dyn crate::encode::writer::VideoWriter> { Box::new(w.clone()) });
    PipelineController::new(
        SessionPaths::new(root),
        PipelineOpts::default(),
        Box::new(recorder),
        factory,
        saver,
    )
    .unwrap()
}

fn capture(ctl: &mut PipelineController, timestamps: &[f64]) {
    ctl.start_recording().unwrap();
    for (i, &t) in timestamps.iter().enumerate() {
        let shade = (i * 40 % 256) as u8;
        ctl.append_frame_at(solid([shade, 0, 0, 255]), t).unwrap();
    }
}

fn states(rx: &Receiver<PipelineEvent>) -> Vec<PipelineState> {
    rx.try_iter()
        .filter_map(|ev| match ev {
            PipelineEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect()
}

const SETTLE: Duration = Duration::from_secs(20);

#[test]
fn full_cycle_reaches_done() {
    let root = temp_root("full");
    let writer = TestWriter::default();
    let mut ctl = controller(&root, FixedRecorder::new(3.0), &writer, Box::new(KeepInPlace));
    let events = ctl.subscribe();

    capture(&mut ctl, &[0.0, 1.2, 2.5]);
    assert_eq!(ctl.state(), PipelineState::Capturing);
    ctl.stop_recording().unwrap();
    assert_eq!(ctl.state(), PipelineState::Composing);
    assert_eq!(ctl.wait_settled(SETTLE), PipelineState::Done);

    assert_eq!(writer.inner.presentation_times(), vec![0.0, 1.2, 2.5]);
    assert_eq!(writer.inner.log().finished_at, Some(3.0));
    assert_eq!(ctl.output(), Some(ctl.paths().video().as_path()));
    assert_eq!(ctl.progress(), 1.0);
    assert_eq!(ctl.frame_count(), 3);
    assert!(ctl.paths().manifest().is_file());

    let all: Vec<PipelineEvent> = events.try_iter().collect();
    let seen: Vec<PipelineState> = all
        .iter()
        .filter_map(|ev| match ev {
            PipelineEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    use PipelineState::*;
    assert_eq!(seen, vec![Capturing, Flushing, Composing, Saving, Done]);
    let captured = all
        .iter()
        .filter(|ev| matches!(ev, PipelineEvent::FrameCaptured { .. }))
        .count();
    assert_eq!(captured, 3);
    assert!(all.contains(&PipelineEvent::Progress(1.0)));
    assert!(all.iter().any(|ev| matches!(ev, PipelineEvent::Saved { .. })));
    for ev in &all {
        if let PipelineEvent::Progress(v) = ev {
            assert!((0.0..=1.0).contains(v));
        }
    }

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn operations_outside_their_states_are_rejected() {
    let root = temp_root("invalid");
    let writer = TestWriter::default();
    let mut ctl = controller(&root, FixedRecorder::new(1.0), &writer, Box::new(KeepInPlace));

    assert!(matches!(
        ctl.stop_recording(),
        Err(SketchError::InvalidTransition {
            from: PipelineState::Idle,
            ..
        })
    ));
    assert!(matches!(ctl.retry(), Err(SketchError::InvalidTransition { .. })));
    assert!(matches!(
        ctl.append_frame_at(solid([0, 0, 0, 255]), 0.0),
        Err(SketchError::InvalidTransition { .. })
    ));
    assert_eq!(ctl.on_surface_update(solid([0, 0, 0, 255]), true).unwrap(), None);
    assert_eq!(ctl.frame_count(), 0);

    ctl.start_recording().unwrap();
    assert!(matches!(
        ctl.start_recording(),
        Err(SketchError::InvalidTransition {
            from: PipelineState::Capturing,
            ..
        })
    ));

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn surface_updates_are_timestamped_from_recording_start() {
    let root = temp_root("surface");
    let writer = TestWriter::default();
    let mut ctl = controller(&root, FixedRecorder::new(1.0), &writer, Box::new(KeepInPlace));
    ctl.start_recording().unwrap();

    let a = ctl.on_surface_update(solid([0, 0, 0, 255]), false).unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    let b = ctl.on_surface_update(solid([9, 9, 9, 255]), true).unwrap().unwrap();
    assert_eq!(a.index, FrameIndex(1));
    assert_eq!(b.index, FrameIndex(2));
    assert!(b.captured_at > a.captured_at);

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn empty_capture_fails_without_composing() {
    let root = temp_root("empty");
    let writer = TestWriter::default();
    let mut ctl = controller(&root, FixedRecorder::new(2.0), &writer, Box::new(KeepInPlace));
    let events = ctl.subscribe();

    capture(&mut ctl, &[]);
    let err = ctl.stop_recording().unwrap_err();
    assert!(matches!(err, SketchError::EmptyInput(_)));
    assert_eq!(ctl.state(), PipelineState::Failed);
    assert!(!states(&events).contains(&PipelineState::Composing));
    assert!(writer.inner.log().config.is_none());

    let err = ctl.retry().unwrap_err();
    assert!(matches!(err, SketchError::EmptyInput(_)));
    assert_eq!(ctl.state(), PipelineState::Failed);
    let after: Vec<PipelineEvent> = events.try_iter().collect();
    assert!(!after.iter().any(|ev| matches!(
        ev,
        PipelineEvent::StateChanged { .. } | PipelineEvent::Progress(_)
    )));
    assert!(after.iter().any(|ev| matches!(
        ev,
        PipelineEvent::Failed { kind: ErrorKind::EmptyInput, .. }
    )));
    assert!(ctl.last_run_report().is_none());
    assert!(writer.inner.log().config.is_none());

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn zero_length_narration_fails_without_composing() {
    let root = temp_root("silent");
    let writer = TestWriter::default();
    let mut ctl = controller(&root, FixedRecorder::new(0.0), &writer, Box::new(KeepInPlace));

    let events = ctl.subscribe();

    capture(&mut ctl, &[0.0]);
    assert!(matches!(ctl.stop_recording(), Err(SketchError::EmptyInput(_))));
    assert_eq!(ctl.state(), PipelineState::Failed);
    assert!(matches!(ctl.retry(), Err(SketchError::EmptyInput(_))));
    assert_eq!(ctl.state(), PipelineState::Failed);
    assert!(!states(&events).contains(&PipelineState::Composing));
    assert!(writer.inner.log().config.is_none());

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn frame_write_failure_is_reported_while_capturing_and_fails_the_cycle() {
    let root = temp_root("writefail");
    let writer = TestWriter::default();
    let mut ctl = controller(&root, FixedRecorder::new(2.0), &writer, Box::new(KeepInPlace));
    let events = ctl.subscribe();

    ctl.start_recording().unwrap();
    // A directory in the frame's place makes the final rename fail.
    std::fs::create_dir_all(ctl.paths().frame(FrameIndex(2)).join("occupied")).unwrap();
    ctl.append_frame_at(solid([0, 0, 0, 255]), 0.0).unwrap();
    ctl.append_frame_at(solid([40, 0, 0, 255]), 0.5).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut reported = None;
    while reported.is_none() && Instant::now() < deadline {
        ctl.pump();
        reported = events.try_iter().find_map(|ev| match ev {
            PipelineEvent::Failed {
                kind, retryable, ..
            } => Some((kind, retryable)),
            _ => None,
        });
        if reported.is_none() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    assert_eq!(reported, Some((ErrorKind::FrameWriteFailed, false)));
    assert_eq!(ctl.state(), PipelineState::Capturing);

    let err = ctl.append_frame_at(solid([80, 0, 0, 255]), 1.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FrameWriteFailed);

    let err = ctl.stop_recording().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FrameWriteFailed);
    assert_eq!(ctl.state(), PipelineState::Failed);
    assert!(!states(&events).contains(&PipelineState::Composing));
    assert!(writer.inner.log().config.is_none());

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn audio_configuration_failure_stays_idle() {
    let root = temp_root("audiocfg");
    let writer = TestWriter::default();
    let mut recorder = FixedRecorder::new(1.0);
    recorder.fail_start = true;
    let mut ctl = controller(&root, recorder, &writer, Box::new(KeepInPlace));

    let err = ctl.start_recording().unwrap_err();
    assert!(matches!(err, SketchError::AudioConfigurationFailed(_)));
    assert_eq!(ctl.state(), PipelineState::Idle);

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn audio_finalize_failure_returns_to_idle_and_discards_frames() {
    let root = temp_root("audiofin");
    let writer = TestWriter::default();
    let mut recorder = FixedRecorder::new(1.0);
    recorder.fail_stop = true;
    let mut ctl = controller(&root, recorder, &writer, Box::new(KeepInPlace));
    let events = ctl.subscribe();

    capture(&mut ctl, &[0.0, 0.5]);
    let err = ctl.stop_recording().unwrap_err();
    assert!(matches!(err, SketchError::AudioFinalizeFailed(_)));
    assert_eq!(ctl.state(), PipelineState::Idle);
    assert_eq!(ctl.frame_count(), 0);
    assert!(!ctl.paths().frame(FrameIndex(1)).exists());

    let failed = events.try_iter().any(|ev| {
        matches!(
            ev,
            PipelineEvent::Failed {
                kind: ErrorKind::AudioFinalizeFailed,
                retryable: false,
                ..
            }
        )
    });
    assert!(failed);

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn failed_composition_can_be_retried_against_the_same_frames() {
    let root = temp_root("retry");
    let writer = TestWriter::default();
    writer.fail.store(true, Ordering::SeqCst);
    let mut ctl = controller(&root, FixedRecorder::new(2.0), &writer, Box::new(KeepInPlace));
    let events = ctl.subscribe();

    capture(&mut ctl, &[0.0, 0.4, 1.1, 1.6]);
    ctl.stop_recording().unwrap();
    assert_eq!(ctl.wait_settled(SETTLE), PipelineState::Failed);
    let failure = events.try_iter().find_map(|ev| match ev {
        PipelineEvent::Failed {
            kind, retryable, ..
        } => Some((kind, retryable)),
        _ => None,
    });
    assert_eq!(failure, Some((ErrorKind::EncoderWriteFailed, true)));
    assert!(ctl.progress() < 1.0);
    assert!(!ctl.paths().video().exists());

    writer.fail.store(false, Ordering::SeqCst);
    ctl.retry().unwrap();
    assert_eq!(ctl.wait_settled(SETTLE), PipelineState::Done);
    assert_eq!(ctl.frame_count(), 4);
    assert_eq!(writer.inner.log().frames.len(), 4);
    assert_eq!(ctl.last_run_report().unwrap().outstanding_at_exit, 0);

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn cancel_while_composing_cleans_everything_up() {
    let root = temp_root("cancel");
    let writer = TestWriter {
        delay: Duration::from_millis(150),
        ..TestWriter::default()
    };
    let mut ctl = controller(&root, FixedRecorder::new(5.0), &writer, Box::new(KeepInPlace));

    capture(&mut ctl, &[0.0, 1.0, 2.0, 3.0, 4.0]);
    ctl.stop_recording().unwrap();
    assert_eq!(ctl.state(), PipelineState::Composing);
    assert!(matches!(
        ctl.start_recording(),
        Err(SketchError::InvalidTransition {
            from: PipelineState::Composing,
            ..
        })
    ));

    ctl.cancel().unwrap();
    assert_eq!(ctl.state(), PipelineState::Idle);
    assert_eq!(ctl.frame_count(), 0);
    assert!(!root.exists());
    assert!(ctl.output().is_none());
    let report = ctl.last_run_report().unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.outstanding_at_exit, 0);

    // Nothing stale leaks into the next cycle.
    assert_eq!(ctl.pump(), 0);
    assert_eq!(ctl.state(), PipelineState::Idle);

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn cancel_while_capturing_aborts_the_narration() {
    let root = temp_root("cancelcap");
    let writer = TestWriter::default();
    let recorder = FixedRecorder::new(1.0);
    let aborted = recorder.aborted.clone();
    let mut ctl = controller(&root, recorder, &writer, Box::new(KeepInPlace));

    capture(&mut ctl, &[0.0, 0.2]);
    ctl.cancel().unwrap();
    assert!(aborted.load(Ordering::SeqCst));
    assert_eq!(ctl.state(), PipelineState::Idle);
    assert_eq!(ctl.frame_count(), 0);

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn save_permission_denial_is_not_a_pipeline_failure() {
    let root = temp_root("denied");
    let writer = TestWriter::default();
    let mut ctl = controller(&root, FixedRecorder::new(1.0), &writer, Box::new(DenyingSaver));
    let events = ctl.subscribe();

    capture(&mut ctl, &[0.0]);
    ctl.stop_recording().unwrap();
    assert_eq!(ctl.wait_settled(SETTLE), PipelineState::Done);
    let video = ctl.paths().video();
    assert_eq!(ctl.output(), Some(video.as_path()));
    let all: Vec<PipelineEvent> = events.try_iter().collect();
    assert!(all.contains(&PipelineEvent::SavePermissionDenied { output: video }));
    assert!(!all.iter().any(|ev| matches!(ev, PipelineEvent::Failed { .. })));

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn other_save_errors_fail_the_cycle() {
    let root = temp_root("brokensave");
    let writer = TestWriter::default();
    let mut ctl = controller(&root, FixedRecorder::new(1.0), &writer, Box::new(BrokenSaver));

    capture(&mut ctl, &[0.0]);
    ctl.stop_recording().unwrap();
    assert_eq!(ctl.wait_settled(SETTLE), PipelineState::Failed);
    assert!(ctl.output().is_none());

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn new_recording_after_done_starts_a_fresh_sequence() {
    let root = temp_root("again");
    let writer = TestWriter::default();
    let mut ctl = controller(&root, FixedRecorder::new(1.0), &writer, Box::new(KeepInPlace));

    capture(&mut ctl, &[0.0, 0.5]);
    ctl.stop_recording().unwrap();
    assert_eq!(ctl.wait_settled(SETTLE), PipelineState::Done);

    ctl.start_recording().unwrap();
    assert_eq!(ctl.frame_count(), 0);
    assert!(ctl.output().is_none());
    assert_eq!(ctl.progress(), 0.0);
    let h = ctl.append_frame_at(solid([1, 2, 3, 255]), 0.0).unwrap();
    assert_eq!(h.index, FrameIndex::FIRST);

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn progress_ticks_stay_below_completion_while_composing() {
    let root = temp_root("progress");
    let writer = TestWriter {
        delay: Duration::from_millis(120),
        ..TestWriter::default()
    };
    let mut ctl = controller(&root, FixedRecorder::new(3.0), &writer, Box::new(KeepInPlace));
    let events = ctl.subscribe();

    capture(&mut ctl, &[0.0, 0.5, 1.0, 1.5]);
    ctl.stop_recording().unwrap();
    assert_eq!(ctl.wait_settled(SETTLE), PipelineState::Done);

    let values: Vec<f64> = events
        .try_iter()
        .filter_map(|ev| match ev {
            PipelineEvent::Progress(v) => Some(v),
            _ => None,
        })
        .collect();
    let (last, rest) = values.split_last().unwrap();
    assert_eq!(*last, 1.0);
    assert!(rest.iter().all(|v| *v < 1.0));
    assert!(rest.windows(2).all(|w| w[0] <= w[1]));

    drop(ctl);
    std::fs::remove_dir_all(&root).ok();
}
