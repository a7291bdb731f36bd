use crate::foundation::error::{SketchError, SketchResult};
use std::time::Duration;

/// Calibration of the synthetic composition progress signal.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProgressOpts {
    /// Expected wall-clock composition time, in seconds.
    pub estimated_processing_secs: f64,
    /// Per-tick increment is `audio_secs / increment_divisor`.
    pub increment_divisor: f64,
    /// Lower bound for the tick period.
    pub min_tick_interval_ms: u64,
    /// Highest value reported before the compositor confirms success.
    pub ceiling: f64,
}

impl Default for ProgressOpts {
    fn default() -> Self {
        Self {
            estimated_processing_secs: 60.0,
            increment_divisor: 600.0,
            min_tick_interval_ms: 50,
            ceiling: 0.99,
        }
    }
}

impl ProgressOpts {
    /// Reject non-positive or non-finite calibration values.
    pub fn validate(&self) -> SketchResult<()> {
        if !self.estimated_processing_secs.is_finite() || self.estimated_processing_secs <= 0.0 {
            return Err(SketchError::validation(
                "estimated_processing_secs must be finite and > 0",
            ));
        }
        if !self.increment_divisor.is_finite() || self.increment_divisor <= 0.0 {
            return Err(SketchError::validation(
                "increment_divisor must be finite and > 0",
            ));
        }
        if self.min_tick_interval_ms == 0 {
            return Err(SketchError::validation("min_tick_interval_ms must be > 0"));
        }
        if !(self.ceiling > 0.0 && self.ceiling < 1.0) {
            return Err(SketchError::validation("ceiling must be in (0, 1)"));
        }
        Ok(())
    }
}

/// Estimated composition progress in `[0, 1]`.
///
/// The compositor reports no fine-grained progress, so the value advances by a fixed increment on
/// every tick and stalls at `ceiling` until [`ProgressEstimator::complete`] is called.
#[derive(Clone, Debug)]
pub struct ProgressEstimator {
    ceiling: f64,
    tick_interval: Duration,
    increment: f64,
    value: f64,
}

impl ProgressEstimator {
    /// Calibrate for a narration of `audio_secs` seconds.
    pub fn new(audio_secs: f64, opts: &ProgressOpts) -> SketchResult<Self> {
        opts.validate()?;
        if !audio_secs.is_finite() || audio_secs < 0.0 {
            return Err(SketchError::validation(
                "audio duration must be finite and non-negative",
            ));
        }
        let min = Duration::from_millis(opts.min_tick_interval_ms);
        let tick_interval =
            Duration::from_secs_f64(audio_secs / opts.estimated_processing_secs).max(min);
        Ok(Self {
            ceiling: opts.ceiling,
            tick_interval,
            increment: audio_secs / opts.increment_divisor,
            value: 0.0,
        })
    }

    /// Period between ticks.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Amount added per tick.
    pub fn increment(&self) -> f64 {
        self.increment
    }

    /// Current estimate.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Advance by one increment and return the new value. Never reaches `1.0`.
    pub fn tick(&mut self) -> f64 {
        if self.value < self.ceiling {
            self.value = (self.value + self.increment).min(self.ceiling);
        }
        self.value
    }

    /// Report completion; the only way to reach `1.0`.
    pub fn complete(&mut self) -> f64 {
        self.value = 1.0;
        self.value
    }

    /// Start over from zero.
    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

#[cfg(test)]
#[path = "../../tests/unit/pipeline/progress.rs"]
mod tests;
