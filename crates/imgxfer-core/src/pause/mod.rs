//! Pause and resume with bounded phase polling.
//!
//! The control plane applies phase changes asynchronously. A pause request
//! only counts once the session is observed in `paused_user`; a resume only
//! counts once it is back in `transferring`. Each wait is bounded, and the
//! bound is checked after a query, so a wait may overrun by one poll
//! interval.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::session::{ControlPlane, Phase, TransferSession};

/// Polling cadence and bounds for phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Interval between phase queries
    pub interval: Duration,
    /// Time allowed to reach `paused_user`
    pub pause_timeout: Duration,
    /// Time allowed to get back to `transferring`
    pub resume_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECS),
            pause_timeout: Duration::from_secs(crate::DEFAULT_PHASE_CHANGE_TIMEOUT_SECS),
            resume_timeout: Duration::from_secs(crate::DEFAULT_PHASE_CHANGE_TIMEOUT_SECS),
        }
    }
}

/// Drives a session through pause and resume.
#[derive(Debug, Clone, Copy, Default)]
pub struct PauseResumeController {
    settings: PollSettings,
}

impl PauseResumeController {
    /// Create a controller with the given polling bounds.
    #[must_use]
    pub const fn new(settings: PollSettings) -> Self {
        Self { settings }
    }

    /// Polling bounds in use.
    #[must_use]
    pub const fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Request a pause, wait for `paused_user`, then hold for `settle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PauseTimeout`] if the phase is not reached in time,
    /// or any control-plane error.
    pub async fn pause<C: ControlPlane>(
        &self,
        session: &mut TransferSession<C>,
        settle: Duration,
    ) -> Result<()> {
        session.pause().await?;

        let started = Instant::now();
        loop {
            let phase = session.get_phase().await?;
            if phase == Phase::PausedUser {
                tracing::info!(session_id = %session.id(), "Transfer paused");
                break;
            }
            if phase.is_terminal() {
                return Err(ended_while_waiting(session.id(), phase));
            }
            if started.elapsed() > self.settings.pause_timeout {
                return Err(Error::PauseTimeout(self.settings.pause_timeout.as_secs()));
            }
            tokio::time::sleep(self.settings.interval).await;
        }

        if !settle.is_zero() {
            tracing::info!(
                session_id = %session.id(),
                "Holding pause for {}s",
                settle.as_secs()
            );
            tokio::time::sleep(settle).await;
        }
        Ok(())
    }

    /// Request a resume and wait for `transferring`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResumeTimeout`] if the phase is not reached in time,
    /// or any control-plane error.
    pub async fn resume<C: ControlPlane>(&self, session: &mut TransferSession<C>) -> Result<()> {
        session.resume().await?;

        let started = Instant::now();
        loop {
            let phase = session.get_phase().await?;
            if phase == Phase::Transferring {
                tracing::info!(session_id = %session.id(), "Transfer resumed");
                return Ok(());
            }
            if phase.is_terminal() {
                return Err(ended_while_waiting(session.id(), phase));
            }
            if started.elapsed() > self.settings.resume_timeout {
                return Err(Error::ResumeTimeout(self.settings.resume_timeout.as_secs()));
            }
            tokio::time::sleep(self.settings.interval).await;
        }
    }

    /// Pause, hold for `settle`, then resume.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`pause`](Self::pause) or
    /// [`resume`](Self::resume).
    pub async fn pause_and_resume<C: ControlPlane>(
        &self,
        session: &mut TransferSession<C>,
        settle: Duration,
    ) -> Result<()> {
        self.pause(session, settle).await?;
        self.resume(session).await
    }
}

fn ended_while_waiting(id: &str, phase: Phase) -> Error {
    Error::Protocol(format!("session {id} ended ({phase}) during a phase change"))
}
