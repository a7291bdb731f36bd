use crate::compose::pool::{PixelBuffer, PixelFormat};
use crate::encode::writer::{VideoWriter, WriterConfig};
use crate::foundation::error::{SketchError, SketchResult};
use crate::session::remove_file_if_exists;
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

/// Options for [`FfmpegWriter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FfmpegWriterOpts {
    /// `ffmpeg` executable to invoke.
    pub program: PathBuf,
    /// Overwrite the output file if it already exists.
    pub overwrite: bool,
    /// x264 constant rate factor.
    pub crf: u8,
}

impl Default for FfmpegWriterOpts {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            overwrite: true,
            crf: 23,
        }
    }
}

/// Writer that spawns the system `ffmpeg` and streams raw RGBA frames to its stdin.
///
/// Presentation times are variable while MP4 output runs at a constant rate, so each frame is
/// repeated until the tick at which the next frame starts; `finish` pads the last frame up to the
/// requested end time and the audio is cut to the video with `-shortest`. Only the most recent
/// frame is kept in memory.
pub struct FfmpegWriter {
    opts: FfmpegWriterOpts,

    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_drain: Option<std::thread::JoinHandle<std::io::Result<Vec<u8>>>>,

    cfg: Option<WriterConfig>,
    // Most recently appended frame, not yet written for its full duration.
    held: Vec<u8>,
    has_held: bool,
    ticks_written: u64,
    last_pts: f64,
}

impl FfmpegWriter {
    /// Create a new writer that streams into `ffmpeg`.
    pub fn new(opts: FfmpegWriterOpts) -> Self {
        Self {
            opts,
            child: None,
            stdin: None,
            stderr_drain: None,
            cfg: None,
            held: Vec::new(),
            has_held: false,
            ticks_written: 0,
            last_pts: 0.0,
        }
    }

    /// Write the held frame until `target` output ticks exist.
    fn write_held_until(&mut self, target: u64) -> SketchResult<()> {
        if !self.has_held {
            return Ok(());
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(SketchError::encoder_write("ffmpeg writer is already finalized"));
        };
        while self.ticks_written < target {
            stdin.write_all(&self.held).map_err(|e| {
                SketchError::encoder_write(format!("failed to write frame to ffmpeg stdin: {e}"))
            })?;
            self.ticks_written += 1;
        }
        Ok(())
    }

    fn stop_child(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.stderr_drain.take() {
            let _ = handle.join();
        }
    }
}

impl VideoWriter for FfmpegWriter {
    fn begin(&mut self, cfg: WriterConfig) -> SketchResult<()> {
        cfg.fps.validate()?;
        if cfg.canvas.is_empty() {
            return Err(SketchError::validation(
                "ffmpeg writer width/height must be non-zero",
            ));
        }
        if !cfg.canvas.width.is_multiple_of(2) || !cfg.canvas.height.is_multiple_of(2) {
            return Err(SketchError::validation(
                "ffmpeg writer width/height must be even (required for yuv420p mp4 output)",
            ));
        }

        ensure_parent_dir(&cfg.out_path)?;
        if !self.opts.overwrite && cfg.out_path.exists() {
            return Err(SketchError::validation(format!(
                "output file '{}' already exists",
                cfg.out_path.display()
            )));
        }

        let mut cmd = Command::new(&self.opts.program);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd.arg(if self.opts.overwrite { "-y" } else { "-n" });

        cmd.args([
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "-s",
            &format!("{}x{}", cfg.canvas.width, cfg.canvas.height),
            "-r",
            &format!("{}/{}", cfg.fps.num, cfg.fps.den),
            "-i",
            "pipe:0",
        ]);
        if let Some(audio) = cfg.audio.as_ref() {
            cmd.arg("-i")
                .arg(audio)
                .args(["-map", "0:v:0", "-map", "1:a:0", "-c:a", "aac", "-shortest"]);
        } else {
            cmd.arg("-an");
        }
        cmd.args([
            "-c:v",
            "libx264",
            "-crf",
            &self.opts.crf.to_string(),
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "+faststart",
        ]);

        let mut child = cmd.arg(&cfg.out_path).spawn().map_err(|e| {
            SketchError::encoder_write(format!(
                "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SketchError::encoder_write("failed to open ffmpeg stdin (unexpected)"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            SketchError::encoder_write("failed to open ffmpeg stderr (unexpected)")
        })?;
        let stderr_drain = std::thread::spawn(move || {
            let mut stderr_bytes = Vec::new();
            stderr.read_to_end(&mut stderr_bytes)?;
            Ok(stderr_bytes)
        });

        tracing::debug!(
            out = %cfg.out_path.display(),
            width = cfg.canvas.width,
            height = cfg.canvas.height,
            "ffmpeg writer started"
        );

        self.held = vec![0u8; cfg.canvas.byte_len()];
        self.has_held = false;
        self.ticks_written = 0;
        self.last_pts = 0.0;
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.stderr_drain = Some(stderr_drain);
        self.cfg = Some(cfg);
        Ok(())
    }

    fn append(&mut self, frame: &PixelBuffer, presentation_secs: f64) -> SketchResult<()> {
        let Some((canvas, fps)) = self.cfg.as_ref().map(|c| (c.canvas, c.fps)) else {
            return Err(SketchError::encoder_write("ffmpeg writer not started"));
        };
        if frame.width != canvas.width || frame.height != canvas.height {
            return Err(SketchError::encoder_write(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width, frame.height, canvas.width, canvas.height
            )));
        }
        if frame.format != PixelFormat::Rgba8 || frame.data.len() != self.held.len() {
            return Err(SketchError::encoder_write(
                "frame data does not match rgba width*height*4",
            ));
        }
        if self.has_held && presentation_secs < self.last_pts {
            return Err(SketchError::encoder_write(
                "ffmpeg writer received out-of-order presentation time",
            ));
        }

        let target = fps.secs_to_frames_round(presentation_secs);
        self.write_held_until(target)?;
        self.held.copy_from_slice(&frame.data);
        self.has_held = true;
        self.last_pts = presentation_secs;
        Ok(())
    }

    fn finish(&mut self, end_secs: f64) -> SketchResult<()> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| SketchError::encoder_finalize("ffmpeg writer not started"))?;
        let target = cfg.fps.secs_to_frames_round(end_secs).max(1);
        self.write_held_until(target)
            .map_err(|e| SketchError::encoder_finalize(e.to_string()))?;

        drop(self.stdin.take());
        let mut child = self
            .child
            .take()
            .ok_or_else(|| SketchError::encoder_finalize("ffmpeg writer not started"))?;
        let status = child.wait().map_err(|e| {
            SketchError::encoder_finalize(format!("failed to wait for ffmpeg to finish: {e}"))
        })?;
        let stderr_bytes = match self.stderr_drain.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| SketchError::encoder_finalize("ffmpeg stderr drain thread panicked"))?
                .map_err(|e| {
                    SketchError::encoder_finalize(format!("ffmpeg stderr read failed: {e}"))
                })?,
            None => Vec::new(),
        };

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_bytes);
            return Err(SketchError::encoder_finalize(format!(
                "ffmpeg exited with status {}: {}",
                status,
                stderr.trim()
            )));
        }

        tracing::debug!(ticks = self.ticks_written, end_secs, "ffmpeg writer finished");
        self.cfg = None;
        self.has_held = false;
        Ok(())
    }

    fn abort(&mut self) {
        self.stop_child();
        if let Some(cfg) = self.cfg.take()
            && let Err(e) = remove_file_if_exists(&cfg.out_path)
        {
            tracing::warn!(error = %e, "failed to remove partial ffmpeg output");
        }
        self.has_held = false;
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.abort();
        }
    }
}

/// Ensure the parent directory of `path` exists.
fn ensure_parent_dir(path: &Path) -> SketchResult<()> {
    if let Some(parent) = path.parent() {
        use anyhow::Context as _;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Return `true` when `ffmpeg` can be invoked from `PATH`.
pub fn is_ffmpeg_on_path() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "../../tests/unit/encode/ffmpeg.rs"]
mod tests;
