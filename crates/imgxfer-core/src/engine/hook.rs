//! Progress hooks.
//!
//! A hook sees the completion fraction after every chunk and may ask the
//! engine to pause the session. The engine has no other way to be steered
//! mid-flight, so scenario drivers (deterministic pause points, operations
//! attempted while a transfer is in progress) live entirely in hooks.

use std::time::Duration;

/// A hook's request to pause the transfer before the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseRequest {
    /// How long to stay paused before resuming
    pub settle: Duration,
}

impl PauseRequest {
    /// Pause for `settle`, then resume.
    #[must_use]
    pub const fn new(settle: Duration) -> Self {
        Self { settle }
    }
}

/// Called by the engine after each chunk with the completion fraction
/// (`0.0..=1.0`).
pub trait ProgressHook: Send {
    /// Return `Some` to pause before the next chunk.
    fn on_progress(&mut self, fraction: f64) -> Option<PauseRequest>;
}

impl<F> ProgressHook for F
where
    F: FnMut(f64) -> Option<PauseRequest> + Send,
{
    fn on_progress(&mut self, fraction: f64) -> Option<PauseRequest> {
        self(fraction)
    }
}

/// Requests one pause the first time completion reaches a fraction.
#[derive(Debug, Clone, Copy)]
pub struct PauseAt {
    fraction: f64,
    settle: Duration,
    fired: bool,
}

impl PauseAt {
    /// Pause once at `fraction` (clamped to `0.0..=1.0`) and hold for `settle`.
    #[must_use]
    pub fn new(fraction: f64, settle: Duration) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            settle,
            fired: false,
        }
    }

    /// Whether the pause has been requested.
    #[must_use]
    pub const fn fired(&self) -> bool {
        self.fired
    }
}

impl ProgressHook for PauseAt {
    fn on_progress(&mut self, fraction: f64) -> Option<PauseRequest> {
        if self.fired || fraction < self.fraction {
            return None;
        }
        self.fired = true;
        Some(PauseRequest::new(self.settle))
    }
}
