//! Control-plane transfer sessions.
//!
//! A [`TransferSession`] is the client-side handle to one server-side image
//! transfer. It hides the session RPCs behind a small API: phase queries,
//! lease renewal, pause/resume requests and finalization.
//!
//! Phase transitions are server-authoritative. The client only asks for a
//! transition and then polls until it is observed; [`TransferSession::pause`]
//! and [`TransferSession::resume`] never block on the new phase themselves
//! (see [`crate::pause`] for the blocking half).
//!
//! ## Lifecycle
//!
//! ```text
//! initializing -> transferring -> { paused_user <-> resuming } -> transferring
//!              -> finalized | cancelled
//! ```

pub mod rest;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Transfer direction, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local file to backend image
    Upload,
    /// Backend image to local file
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// The image a transfer reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageRef {
    /// A disk image, by id
    Disk(String),
    /// A disk snapshot, by id
    Snapshot(String),
}

impl ImageRef {
    /// The backend id of the image or snapshot.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Disk(id) | Self::Snapshot(id) => id,
        }
    }

    /// Whether this reference names a snapshot.
    #[must_use]
    pub const fn is_snapshot(&self) -> bool {
        matches!(self, Self::Snapshot(_))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk(id) => write!(f, "disk {id}"),
            Self::Snapshot(id) => write!(f, "snapshot {id}"),
        }
    }
}

/// Control-plane lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The backend is preparing the image and the proxy ticket
    Initializing,
    /// Bytes may flow through the proxy
    Transferring,
    /// Paused at the client's request
    PausedUser,
    /// Paused by the server (e.g. ticket expired)
    PausedSystem,
    /// A resume was requested and is being applied
    Resuming,
    /// Finalization is running on the server
    Finalizing,
    /// The transfer finished and server resources were released
    Finalized,
    /// The transfer was cancelled or failed server-side
    Cancelled,
    /// A phase this client does not recognise
    Unknown,
}

impl Phase {
    /// Parse a phase as reported by the control plane.
    ///
    /// Unrecognised strings map to [`Phase::Unknown`] rather than failing so
    /// that newer servers do not break polling loops.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "initializing" => Self::Initializing,
            "transferring" => Self::Transferring,
            "paused_user" => Self::PausedUser,
            "paused_system" => Self::PausedSystem,
            "resuming" => Self::Resuming,
            "finalizing_success" | "finalizing_failure" | "finalizing" => Self::Finalizing,
            "finished_success" | "finalized" => Self::Finalized,
            "finished_failure" | "cancelled" | "cancelled_system" | "cancelled_user" => {
                Self::Cancelled
            }
            _ => Self::Unknown,
        }
    }

    /// Whether the server will not move this session any further.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Transferring => "transferring",
            Self::PausedUser => "paused_user",
            Self::PausedSystem => "paused_system",
            Self::Resuming => "resuming",
            Self::Finalizing => "finalizing",
            Self::Finalized => "finalized",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Bearer credential scoped to one session.
///
/// The value is never printed and is not persisted anywhere.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct SignedTicket(String);

impl SignedTicket {
    /// Wrap a ticket string.
    #[must_use]
    pub fn new(ticket: impl Into<String>) -> Self {
        Self(ticket.into())
    }

    /// The raw ticket value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the server has issued a ticket yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value for an `Authorization` header.
    #[must_use]
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for SignedTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignedTicket(<redacted>)")
    }
}

/// What the control plane reports about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Opaque session id
    pub id: String,
    /// Current phase
    pub phase: Phase,
    /// Data-plane URL; may be empty until the session is ready
    pub proxy_url: String,
    /// Credential for the data plane; may be empty until the session is ready
    pub signed_ticket: SignedTicket,
}

/// Image metadata needed to size a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Virtual size of the image in bytes
    pub provisioned_size: u64,
    /// Bytes the image occupies on storage
    pub actual_size: u64,
    /// Image format as reported by the backend (`raw`, `cow`)
    pub format: String,
    /// Storage domain holding the image
    pub storage_domain_id: Option<String>,
}

impl ImageInfo {
    /// Number of bytes the proxy serves for this image.
    ///
    /// Raw images are served at their virtual size; copy-on-write images are
    /// served as the allocated file.
    #[must_use]
    pub fn transfer_size(&self) -> u64 {
        if self.format.eq_ignore_ascii_case("raw") || self.actual_size == 0 {
            self.provisioned_size
        } else {
            self.actual_size
        }
    }
}

/// The control-plane RPC surface a transfer consumes.
pub trait ControlPlane: Send + Sync {
    /// Create a session for `image` in `direction`.
    fn create_session(
        &self,
        image: &ImageRef,
        direction: Direction,
    ) -> impl Future<Output = Result<SessionInfo>> + Send;

    /// Fetch the current state of a session.
    fn get_session(&self, id: &str) -> impl Future<Output = Result<SessionInfo>> + Send;

    /// Renew the session lease.
    fn extend_session(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Ask the server to pause the session.
    fn pause_session(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Ask the server to resume a paused session.
    fn resume_session(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Release server resources held by the session.
    fn finalize_session(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Abort the session server-side.
    fn cancel_session(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Look up size and placement of an image.
    fn image_info(&self, image: &ImageRef) -> impl Future<Output = Result<ImageInfo>> + Send;
}

/// Client-side handle to one control-plane transfer session.
///
/// Owned exclusively by one transfer engine for one attempt. Dropping the
/// handle does not release server resources; call [`finalize`](Self::finalize).
pub struct TransferSession<C> {
    control: Arc<C>,
    info: SessionInfo,
    direction: Direction,
    poll_interval: Duration,
    left_initializing: bool,
    finalized: bool,
}

impl<C> fmt::Debug for TransferSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.info.id)
            .field("direction", &self.direction)
            .field("phase", &self.info.phase)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl<C: ControlPlane> TransferSession<C> {
    /// Create a new session on the control plane.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionCreation`] if the image or snapshot cannot be
    /// resolved or the server refuses the session.
    pub async fn create(control: Arc<C>, image: &ImageRef, direction: Direction) -> Result<Self> {
        let info = control
            .create_session(image, direction)
            .await
            .map_err(|e| match e {
                Error::SessionCreation(_) => e,
                other => Error::SessionCreation(format!("{image}: {other}")),
            })?;

        tracing::info!(
            session_id = %info.id,
            %direction,
            phase = %info.phase,
            "Created transfer session for {image}"
        );

        Ok(Self {
            left_initializing: info.phase != Phase::Initializing,
            control,
            info,
            direction,
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECS),
            finalized: false,
        })
    }

    /// Override the interval between phase polls.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Transfer direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Data-plane URL last reported by the server.
    #[must_use]
    pub fn proxy_url(&self) -> &str {
        &self.info.proxy_url
    }

    /// Data-plane credential for this session.
    #[must_use]
    pub fn signed_ticket(&self) -> &SignedTicket {
        &self.info.signed_ticket
    }

    /// Phase seen by the most recent query.
    #[must_use]
    pub fn last_phase(&self) -> Phase {
        self.info.phase
    }

    /// Whether [`finalize`](Self::finalize) has run.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Query the current phase. Not cached.
    ///
    /// Also picks up the proxy URL and ticket once the server publishes them.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails, or [`Error::Protocol`] if the
    /// server reports `initializing` after the session already left it.
    pub async fn get_phase(&mut self) -> Result<Phase> {
        let latest = self.control.get_session(&self.info.id).await?;

        if latest.phase == Phase::Initializing && self.left_initializing {
            return Err(Error::Protocol(format!(
                "session {} went back to initializing after {}",
                self.info.id, self.info.phase
            )));
        }
        if latest.phase != Phase::Initializing {
            self.left_initializing = true;
        }

        if !latest.proxy_url.is_empty() {
            self.info.proxy_url = latest.proxy_url;
        }
        if !latest.signed_ticket.is_empty() {
            self.info.signed_ticket = latest.signed_ticket;
        }
        if latest.phase != self.info.phase {
            tracing::debug!(
                session_id = %self.info.id,
                from = %self.info.phase,
                to = %latest.phase,
                "Session phase changed"
            );
        }
        self.info.phase = latest.phase;

        Ok(latest.phase)
    }

    /// Poll until the session leaves the initializing phase.
    ///
    /// The deadline is checked after each query, so the wait may overrun
    /// `timeout` by up to one poll interval.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InitializationTimeout`] if `timeout` elapses first,
    /// or any error from the phase query.
    pub async fn wait_until_ready(&mut self, timeout: Duration) -> Result<Phase> {
        let started = Instant::now();

        loop {
            let phase = self.get_phase().await?;
            if phase != Phase::Initializing {
                tracing::info!(session_id = %self.info.id, %phase, "Session ready");
                return Ok(phase);
            }

            if started.elapsed() > timeout {
                return Err(Error::InitializationTimeout(timeout.as_secs()));
            }

            tracing::debug!(session_id = %self.info.id, "Waiting for session to initialize");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Renew the session lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane rejects the renewal.
    pub async fn extend(&self) -> Result<()> {
        tracing::debug!(session_id = %self.info.id, "Extending session lease");
        self.control.extend_session(&self.info.id).await
    }

    /// Request a pause. Does not wait for the paused phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane rejects the request.
    pub async fn pause(&self) -> Result<()> {
        tracing::info!(session_id = %self.info.id, "Requesting pause");
        self.control.pause_session(&self.info.id).await
    }

    /// Request a resume. Does not wait for the transferring phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane rejects the request.
    pub async fn resume(&self) -> Result<()> {
        tracing::info!(session_id = %self.info.id, "Requesting resume");
        self.control.resume_session(&self.info.id).await
    }

    /// Ask the server to abort the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane rejects the request.
    pub async fn cancel(&self) -> Result<()> {
        tracing::info!(session_id = %self.info.id, "Requesting cancel");
        self.control.cancel_session(&self.info.id).await
    }

    /// Release server resources.
    ///
    /// Idempotent: only the first call reaches the control plane. Failures
    /// are logged and swallowed so they never mask the transfer result.
    pub async fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        match self.control.finalize_session(&self.info.id).await {
            Ok(()) => tracing::info!(session_id = %self.info.id, "Session finalized"),
            Err(e) => tracing::warn!(session_id = %self.info.id, "Failed to finalize session: {e}"),
        }
    }
}
