//! Render state machine and progress reporting.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

/// Why a render ended in [`RenderState::Failed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// A batch or readback fence did not signal in time
    Timeout,
    DeviceLost,
    /// Acceleration structures or per-render records could not be built
    Build,
    /// Any other device call failed
    Device,
    /// Denoising or writing the output failed
    Output,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Timeout => "timeout",
            FailureReason::DeviceLost => "device lost",
            FailureReason::Build => "build failed",
            FailureReason::Device => "device error",
            FailureReason::Output => "output failed",
        };
        f.write_str(s)
    }
}

/// `Idle -> Building -> Batching(i of n) -> ReadBack -> Denoise? -> Done`,
/// with `Failed` reachable from every active state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderState {
    #[default]
    Idle,
    Building,
    /// `batch` is 0-based
    Batching { batch: u32, total: u32 },
    ReadBack,
    Denoise,
    Done,
    Failed(FailureReason),
}

impl RenderState {
    /// A render is running and new requests are ignored.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RenderState::Building | RenderState::Batching { .. } | RenderState::ReadBack | RenderState::Denoise
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RenderState::Done | RenderState::Failed(_))
    }
}

impl fmt::Display for RenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderState::Idle => f.write_str("idle"),
            RenderState::Building => f.write_str("building"),
            RenderState::Batching { batch, total } => write!(f, "batch {}/{}", batch + 1, total),
            RenderState::ReadBack => f.write_str("readback"),
            RenderState::Denoise => f.write_str("denoise"),
            RenderState::Done => f.write_str("done"),
            RenderState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Callbacks from the render thread. Keep them short; batches wait on them.
pub trait RenderObserver: Send + Sync {
    fn state_changed(&self, _state: RenderState) {}
    fn batch_completed(&self, _batch: u32, _total: u32, _progress: f32) {}
}

/// State and progress shared with other threads.
#[derive(Debug, Default)]
pub struct RenderStatus {
    state: Mutex<RenderState>,
    /// `f32` bits
    progress: AtomicU32,
}

impl RenderStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RenderState {
        *self.state.lock()
    }

    /// Fraction of batches completed in the current (or last) render, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RenderState) {
        *self.state.lock() = state;
    }

    /// Progress only moves forward within one render.
    pub(crate) fn advance(&self, progress: f32) {
        let progress = progress.clamp(0.0, 1.0);
        if progress > self.progress() {
            self.progress.store(progress.to_bits(), Ordering::Release);
        }
    }

    pub(crate) fn reset_progress(&self) {
        self.progress.store(0.0f32.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_monotonic() {
        let status = RenderStatus::new();
        assert_eq!(status.progress(), 0.0);
        status.advance(0.5);
        status.advance(0.25);
        assert_eq!(status.progress(), 0.5);
        status.advance(2.0);
        assert_eq!(status.progress(), 1.0);
        status.reset_progress();
        assert_eq!(status.progress(), 0.0);
    }

    #[test]
    fn test_state_predicates() {
        assert!(RenderState::Batching { batch: 0, total: 4 }.is_active());
        assert!(!RenderState::Idle.is_active());
        assert!(RenderState::Failed(FailureReason::Timeout).is_finished());
        assert_eq!(RenderState::Batching { batch: 1, total: 4 }.to_string(), "batch 2/4");
    }
}
