use crate::foundation::core::FrameIndex;
use crate::foundation::error::{SketchError, SketchResult};

/// Span of output time during which one frame is on screen: `[start, end)` in seconds.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PresentationInterval {
    /// Frame shown during this interval.
    pub index: FrameIndex,
    /// Inclusive start, in seconds from the beginning of the output.
    pub start: f64,
    /// Exclusive end, in seconds. Never before `start`.
    pub end: f64,
}

impl PresentationInterval {
    /// Length of the interval in seconds (zero for frames that are effectively instantaneous).
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Contiguous, non-overlapping presentation intervals covering `[0, total]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Timeline {
    intervals: Vec<PresentationInterval>,
    total: f64,
}

impl Timeline {
    /// Build the timeline for frames captured at `timestamps` narrated by `audio_duration` seconds.
    ///
    /// Frame `i` is shown from its own capture time until the next frame's capture time; the last
    /// frame is held until the end of the audio. The first frame always starts at zero so the
    /// output has no leading gap. Timestamps that go backwards, or run past the end of the audio,
    /// collapse the affected intervals to zero length instead of producing negative spans.
    pub fn build(timestamps: &[f64], audio_duration: f64) -> SketchResult<Self> {
        if timestamps.is_empty() {
            return Err(SketchError::empty_input("no frames were captured"));
        }
        if !audio_duration.is_finite() || audio_duration <= 0.0 {
            return Err(SketchError::empty_input(format!(
                "audio duration must be positive, got {audio_duration}"
            )));
        }
        if timestamps.iter().any(|t| !t.is_finite()) {
            return Err(SketchError::validation("frame timestamps must be finite"));
        }
        let count = u32::try_from(timestamps.len())
            .map_err(|_| SketchError::validation("too many frames"))?;

        let mut intervals = Vec::with_capacity(timestamps.len());
        let mut start = 0.0f64;
        for (slot, i) in (1..=count).enumerate() {
            let end = match timestamps.get(slot + 1) {
                Some(&next) => next.clamp(start, audio_duration),
                None => audio_duration,
            };
            intervals.push(PresentationInterval {
                index: FrameIndex(i),
                start,
                end,
            });
            start = end;
        }

        Ok(Self {
            intervals,
            total: audio_duration,
        })
    }

    /// Intervals in frame order.
    pub fn intervals(&self) -> &[PresentationInterval] {
        &self.intervals
    }

    /// Number of frames on the timeline.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Always `false` for a built timeline; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total output duration in seconds (the narration length).
    pub fn total_secs(&self) -> f64 {
        self.total
    }
}

#[cfg(test)]
#[path = "../tests/unit/timeline.rs"]
mod tests;
