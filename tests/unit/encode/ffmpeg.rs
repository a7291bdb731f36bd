use super::*;
use crate::foundation::core::{Canvas, Fps};

fn cfg(width: u32, height: u32, out_path: PathBuf) -> WriterConfig {
    WriterConfig {
        canvas: Canvas { width, height },
        fps: Fps::default(),
        audio: None,
        out_path,
    }
}

fn frame(width: u32, height: u32, v: u8) -> PixelBuffer {
    PixelBuffer {
        width,
        height,
        format: PixelFormat::Rgba8,
        data: vec![v; (width * height * 4) as usize],
    }
}

#[test]
fn begin_rejects_odd_or_empty_canvas() {
    let out = std::env::temp_dir().join("sketchreel_ffmpeg_reject.mp4");
    let mut w = FfmpegWriter::new(FfmpegWriterOpts::default());
    assert!(w.begin(cfg(0, 16, out.clone())).is_err());
    assert!(w.begin(cfg(15, 16, out.clone())).is_err());
    let mut bad_fps = cfg(16, 16, out);
    bad_fps.fps = Fps { num: 0, den: 1 };
    assert!(w.begin(bad_fps).is_err());
}

#[test]
fn append_before_begin_fails() {
    let mut w = FfmpegWriter::new(FfmpegWriterOpts::default());
    assert!(matches!(
        w.append(&frame(16, 16, 0), 0.0),
        Err(SketchError::EncoderWriteFailed(_))
    ));
    assert!(matches!(
        w.finish(1.0),
        Err(SketchError::EncoderFinalizeFailed(_))
    ));
}

#[test]
fn missing_program_is_an_encoder_error() {
    let out = std::env::temp_dir().join("sketchreel_ffmpeg_missing.mp4");
    let mut w = FfmpegWriter::new(FfmpegWriterOpts {
        program: PathBuf::from("definitely-not-an-ffmpeg-binary"),
        ..Default::default()
    });
    assert!(matches!(
        w.begin(cfg(16, 16, out)),
        Err(SketchError::EncoderWriteFailed(_))
    ));
}

#[test]
fn variable_times_map_onto_constant_rate_ticks() {
    if !is_ffmpeg_on_path() {
        return;
    }
    let out = std::env::temp_dir().join(format!(
        "sketchreel_ffmpeg_ticks_{}.mp4",
        std::process::id()
    ));
    let mut w = FfmpegWriter::new(FfmpegWriterOpts::default());
    w.begin(cfg(16, 16, out.clone())).unwrap();
    w.append(&frame(16, 16, 10), 0.0).unwrap();
    assert_eq!(w.ticks_written, 0);
    w.append(&frame(16, 16, 20), 0.5).unwrap();
    assert_eq!(w.ticks_written, 15);
    w.append(&frame(16, 16, 30), 0.5).unwrap();
    assert_eq!(w.ticks_written, 15);
    w.finish(1.0).unwrap();
    assert_eq!(w.ticks_written, 30);
    assert!(out.is_file());
    std::fs::remove_file(&out).ok();
}

#[test]
fn abort_removes_partial_output() {
    if !is_ffmpeg_on_path() {
        return;
    }
    let out = std::env::temp_dir().join(format!(
        "sketchreel_ffmpeg_abort_{}.mp4",
        std::process::id()
    ));
    let mut w = FfmpegWriter::new(FfmpegWriterOpts::default());
    w.begin(cfg(16, 16, out.clone())).unwrap();
    w.append(&frame(16, 16, 10), 0.0).unwrap();
    w.append(&frame(16, 16, 10), 1.0).unwrap();
    w.abort();
    assert!(!out.exists());
}
