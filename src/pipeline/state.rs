/// Lifecycle of one recording cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PipelineState {
    /// Nothing recorded; no persisted frames.
    Idle,
    /// Narration is recording and surface updates append frames.
    Capturing,
    /// Recording stopped; waiting for the last frame write to land.
    Flushing,
    /// The compositor is running.
    Composing,
    /// The output is being handed to the save collaborator.
    Saving,
    /// Composition or flushing failed; frames are kept for a retry.
    Failed,
    /// The cycle finished and the output was handed off.
    Done,
}

impl PipelineState {
    /// Return `true` while a cycle is past capture but not yet settled.
    ///
    /// A new recording may not start in these states.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Flushing | Self::Composing | Self::Saving)
    }

    /// Return `true` when the controller may move from `self` to `to`.
    ///
    /// Any state may return to [`PipelineState::Idle`] (cancel/clear).
    pub fn can_transition_to(self, to: PipelineState) -> bool {
        use PipelineState::*;
        match (self, to) {
            (_, Idle) => true,
            (Idle | Failed | Done, Capturing) => true,
            (Capturing, Flushing) => true,
            (Flushing, Composing | Failed) => true,
            (Composing, Saving | Failed) => true,
            (Failed, Composing) => true,
            (Saving, Done | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/pipeline/state.rs"]
mod tests;
