//! Chunked transfer engine.
//!
//! One [`TransferEngine`] drives one transfer at a time: it creates the
//! control-plane session, waits for it to become ready, opens the proxy
//! channel and runs the byte loop. Whatever happens in between, the session
//! is finalized and then the channel closed, exactly once each.
//!
//! ## State machine
//!
//! ```text
//! Idle -> Active -> { Paused -> Active, Completed, Failed }
//! ```
//!
//! ## Download
//!
//! The lease is renewed before every chunk. Each chunk is one `Range`
//! request of at most `download_chunk_size` bytes, requested strictly in
//! order with no gaps or overlaps. A status `>= 300` or a short body fails
//! the transfer.
//!
//! ## Upload
//!
//! A single `PUT` carries the whole image. The source is read in
//! `upload_buffer_size` slices and streamed onto the open request; the lease
//! is renewed once `extend_interval` has passed since the last renewal. The
//! proxy's final response decides success.
//!
//! Failed chunks are not retried.

pub mod hook;

pub use hook::{PauseAt, PauseRequest, ProgressHook};

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pause::{PauseResumeController, PollSettings};
use crate::proxy::{ChannelConnector, DataChannel};
use crate::session::{ControlPlane, Direction, ImageRef, Phase, TransferSession};

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on one download `Range`
    pub download_chunk_size: u64,
    /// Bytes read from the upload source per iteration
    pub upload_buffer_size: usize,
    /// Minimum time between lease renewals during an upload
    pub extend_interval: Duration,
    /// Minimum time between upload progress log lines
    pub progress_interval: Duration,
    /// Time allowed for the session to leave `initializing`
    pub ready_timeout: Duration,
    /// Pause/resume polling
    pub polling: PollSettings,
}

impl EngineConfig {
    /// Reject sizes the transfer loops cannot make progress with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first zero size.
    pub fn validate(&self) -> Result<()> {
        let zero = |key: &str| {
            Err(Error::InvalidConfig {
                key: key.to_string(),
                reason: "must be greater than zero".to_string(),
            })
        };
        if self.download_chunk_size == 0 {
            return zero("download_chunk_size");
        }
        if self.upload_buffer_size == 0 {
            return zero("upload_buffer_size");
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_chunk_size: crate::DEFAULT_DOWNLOAD_CHUNK_SIZE,
            upload_buffer_size: crate::DEFAULT_UPLOAD_BUFFER_SIZE,
            extend_interval: Duration::from_secs(crate::DEFAULT_EXTEND_INTERVAL_SECS),
            progress_interval: Duration::from_secs(crate::DEFAULT_PROGRESS_INTERVAL_SECS),
            ready_timeout: Duration::from_secs(crate::DEFAULT_READY_TIMEOUT_SECS),
            polling: PollSettings::default(),
        }
    }
}

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No transfer running
    Idle,
    /// Bytes are flowing
    Active,
    /// Paused at a hook's request
    Paused,
    /// The last transfer succeeded
    Completed,
    /// The last transfer failed
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What to transfer. Immutable once the transfer starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Backend image or snapshot
    pub image: ImageRef,
    /// Upload or download
    pub direction: Direction,
    /// Local file
    pub path: PathBuf,
    /// Bytes to transfer, if known up front
    pub total_size: Option<u64>,
}

impl TransferRequest {
    /// Upload `path` into `image`.
    pub fn upload(image: ImageRef, path: impl Into<PathBuf>) -> Self {
        Self {
            image,
            direction: Direction::Upload,
            path: path.into(),
            total_size: None,
        }
    }

    /// Download `image` into `path`.
    pub fn download(image: ImageRef, path: impl Into<PathBuf>) -> Self {
        Self {
            image,
            direction: Direction::Download,
            path: path.into(),
            total_size: None,
        }
    }

    /// Fix the transfer size instead of discovering it.
    #[must_use]
    pub const fn with_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }
}

/// Live progress of the current transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Engine state
    pub state: EngineState,
    /// Bytes the proxy has taken or served
    pub bytes_transferred: u64,
    /// Bytes the transfer will move in total
    pub total_size: u64,
    /// Average throughput since the start
    pub speed_bps: u64,
    /// When the transfer started
    pub started_at: Instant,
}

impl TransferProgress {
    fn new(total_size: u64) -> Self {
        Self {
            state: EngineState::Idle,
            bytes_transferred: 0,
            total_size,
            speed_bps: 0,
            started_at: Instant::now(),
        }
    }

    /// Completion in `0.0..=1.0`.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        completion(self.bytes_transferred, self.total_size)
    }

    /// Completion percentage (0-100).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        self.fraction() * 100.0
    }
}

/// A finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Id of this run (also on the tracing span)
    pub transfer_id: Uuid,
    /// Control-plane session used
    pub session_id: String,
    /// Upload or download
    pub direction: Direction,
    /// Bytes moved
    pub bytes_transferred: u64,
    /// Wall time from session creation to cleanup
    pub elapsed: Duration,
    /// When cleanup finished
    pub finished_at: DateTime<Utc>,
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transfer completed, {} bytes transferred",
            self.bytes_transferred
        )
    }
}

/// A failed transfer. Never partially successful; the byte count is for
/// diagnostics only.
#[derive(Debug, thiserror::Error)]
#[error("{error} ({bytes_transferred} bytes transferred)")]
pub struct TransferFailure {
    /// What failed
    #[source]
    pub error: Error,
    /// Bytes moved before the failure
    pub bytes_transferred: u64,
}

impl TransferFailure {
    fn new(error: Error, bytes_transferred: u64) -> Self {
        Self {
            error,
            bytes_transferred,
        }
    }
}

/// Drives transfers between local files and backend images.
pub struct TransferEngine<C, K> {
    control: Arc<C>,
    connector: K,
    config: EngineConfig,
    hook: Option<Box<dyn ProgressHook>>,
    progress_tx: watch::Sender<TransferProgress>,
    progress_rx: watch::Receiver<TransferProgress>,
    cancel: CancellationToken,
}

impl<C, K> fmt::Debug for TransferEngine<C, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .field("state", &self.progress_rx.borrow().state)
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

impl<C, K> TransferEngine<C, K>
where
    C: ControlPlane,
    K: ChannelConnector,
{
    /// Create an engine over a control plane and a proxy connector.
    pub fn new(control: Arc<C>, connector: K, config: EngineConfig) -> Self {
        let (progress_tx, progress_rx) = watch::channel(TransferProgress::new(0));
        Self {
            control,
            connector,
            config,
            hook: None,
            progress_tx,
            progress_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Install a progress hook.
    #[must_use]
    pub fn with_hook(mut self, hook: impl ProgressHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Subscribe to progress updates.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress_rx.clone()
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.progress_rx.borrow().state
    }

    /// Handle that aborts the running transfer when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `request` against its local file.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferFailure`] carrying the first error and the bytes
    /// moved before it.
    pub async fn run(
        &mut self,
        request: &TransferRequest,
    ) -> std::result::Result<TransferOutcome, TransferFailure> {
        self.check_config()?;

        match request.direction {
            Direction::Upload => {
                let (file, size) = open_source(&request.path, request.total_size)
                    .await
                    .map_err(|e| self.fail_early(e))?;
                self.upload_from(&request.image, file, size).await
            }
            Direction::Download => {
                let total = match request.total_size {
                    Some(size) => size,
                    None => self.discover_size(&request.image).await?,
                };
                let file = tokio::fs::File::create(&request.path)
                    .await
                    .map_err(|e| self.fail_early(e.into()))?;
                self.download_to(&request.image, file, Some(total)).await
            }
        }
    }

    /// Download `image` into `sink`.
    ///
    /// With no `total_size`, the size is looked up on the control plane.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferFailure`] carrying the first error and the bytes
    /// written to `sink` before it.
    pub async fn download_to<W>(
        &mut self,
        image: &ImageRef,
        mut sink: W,
        total_size: Option<u64>,
    ) -> std::result::Result<TransferOutcome, TransferFailure>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.check_config()?;
        let total = match total_size {
            Some(size) => size,
            None => self.discover_size(image).await?,
        };

        let transfer_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "transfer",
            %transfer_id,
            direction = %Direction::Download,
            %image,
            total
        );

        async {
            let cancel = self.cancel.clone();
            let mut session = self.open_session(image, Direction::Download, total).await?;
            let mut channel = None;
            let mut pos = 0u64;

            let result = self
                .download_loop(&mut session, &mut channel, &mut sink, total, &mut pos, &cancel)
                .await;

            self.finish(transfer_id, session, channel, result, pos, &cancel)
                .await
        }
        .instrument(span)
        .await
    }

    /// Upload exactly `total_size` bytes from `source` into `image`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferFailure`] carrying the first error and the bytes
    /// handed to the proxy before it. A source that ends early fails with
    /// [`Error::UnexpectedEof`].
    pub async fn upload_from<R>(
        &mut self,
        image: &ImageRef,
        mut source: R,
        total_size: u64,
    ) -> std::result::Result<TransferOutcome, TransferFailure>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.check_config()?;
        let transfer_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "transfer",
            %transfer_id,
            direction = %Direction::Upload,
            %image,
            total = total_size
        );

        async {
            let cancel = self.cancel.clone();
            let mut session = self
                .open_session(image, Direction::Upload, total_size)
                .await?;
            let mut channel = None;
            let mut pos = 0u64;

            let result = self
                .upload_loop(
                    &mut session,
                    &mut channel,
                    &mut source,
                    total_size,
                    &mut pos,
                    &cancel,
                )
                .await;

            self.finish(transfer_id, session, channel, result, pos, &cancel)
                .await
        }
        .instrument(span)
        .await
    }

    async fn discover_size(&self, image: &ImageRef) -> std::result::Result<u64, TransferFailure> {
        let info = self
            .control
            .image_info(image)
            .await
            .map_err(|e| self.fail_early(e))?;
        let size = info.transfer_size();
        tracing::debug!(%image, format = %info.format, size, "Resolved image size");
        Ok(size)
    }

    fn check_config(&self) -> std::result::Result<(), TransferFailure> {
        self.config.validate().map_err(|e| self.fail_early(e))
    }

    /// Record a failure that happened before any session existed.
    fn fail_early(&self, error: Error) -> TransferFailure {
        tracing::error!("Transfer not started: {error}");
        self.set_state(EngineState::Failed);
        TransferFailure::new(error, 0)
    }

    /// Reset progress and create the session. Nothing needs cleanup if this
    /// fails.
    async fn open_session(
        &mut self,
        image: &ImageRef,
        direction: Direction,
        total: u64,
    ) -> std::result::Result<TransferSession<C>, TransferFailure> {
        self.progress_tx.send_replace(TransferProgress::new(total));

        match TransferSession::create(Arc::clone(&self.control), image, direction).await {
            Ok(session) => Ok(session.with_poll_interval(self.config.polling.interval)),
            Err(e) => {
                tracing::error!("Session creation failed: {e}");
                self.set_state(EngineState::Failed);
                Err(TransferFailure::new(e, 0))
            }
        }
    }

    /// Wait for the session and connect the channel.
    async fn connect(
        &mut self,
        session: &mut TransferSession<C>,
        cancel: &CancellationToken,
    ) -> Result<K::Channel> {
        let phase = or_cancelled(
            cancel,
            || Error::Cancelled,
            session.wait_until_ready(self.config.ready_timeout),
        )
        .await?;
        if phase != Phase::Transferring {
            return Err(Error::Protocol(format!(
                "session {} is {phase}, expected transferring",
                session.id()
            )));
        }
        if session.proxy_url().is_empty() {
            return Err(Error::Connection(format!(
                "session {} has no proxy URL",
                session.id()
            )));
        }

        let channel = or_cancelled(
            cancel,
            || Error::Cancelled,
            self.connector
                .connect(session.proxy_url(), session.signed_ticket()),
        )
        .await?;
        self.set_state(EngineState::Active);
        Ok(channel)
    }

    async fn download_loop<W>(
        &mut self,
        session: &mut TransferSession<C>,
        slot: &mut Option<K::Channel>,
        sink: &mut W,
        total: u64,
        pos: &mut u64,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let channel = slot.insert(self.connect(session, cancel).await?);

        while *pos < total {
            session.extend().await?;

            let len = self.config.download_chunk_size.min(total - *pos);
            let start = *pos;
            let end = start + len - 1;

            let response = or_cancelled(
                cancel,
                || cancelled_at(start),
                channel.download_chunk(start, end),
            )
            .await?;
            if !response.is_success() {
                return Err(Error::TransferAborted {
                    offset: start,
                    reason: format!("proxy returned status {}", response.status),
                });
            }
            if response.body.len() as u64 != len {
                return Err(Error::TransferAborted {
                    offset: start,
                    reason: format!("expected {len} bytes, received {}", response.body.len()),
                });
            }

            sink.write_all(&response.body).await?;
            *pos += len;

            let progress = self.publish(*pos);
            tracing::info!(
                bytes = *pos,
                total,
                "Downloaded {:.1}%",
                progress.percentage()
            );

            self.consult_hook(session, &progress, cancel).await?;
        }

        sink.flush().await?;
        Ok(())
    }

    async fn upload_loop<R>(
        &mut self,
        session: &mut TransferSession<C>,
        slot: &mut Option<K::Channel>,
        source: &mut R,
        total: u64,
        pos: &mut u64,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let channel = slot.insert(self.connect(session, cancel).await?);
        channel.upload_prepare(total).await?;

        let mut buf = vec![0u8; self.config.upload_buffer_size];
        let mut last_extend = Instant::now();
        let mut last_progress = Instant::now();

        while *pos < total {
            let want = usize::try_from(total - *pos).map_or(buf.len(), |r| r.min(buf.len()));
            let n = source.read(&mut buf[..want]).await?;
            if n == 0 {
                if let Err(e) = session.pause().await {
                    tracing::warn!("Best-effort pause after short source failed: {e}");
                }
                return Err(Error::UnexpectedEof {
                    position: *pos,
                    expected: total,
                });
            }

            let offset = *pos;
            or_cancelled(
                cancel,
                || cancelled_at(offset),
                channel.upload_chunk(&buf[..n]),
            )
            .await?;
            *pos += n as u64;

            if last_extend.elapsed() > self.config.extend_interval {
                session.extend().await?;
                last_extend = Instant::now();
            }

            let progress = self.publish(*pos);
            if last_progress.elapsed() > self.config.progress_interval {
                tracing::info!(
                    bytes = *pos,
                    total,
                    "Uploaded {:.1}%",
                    progress.percentage()
                );
                last_progress = Instant::now();
            }

            self.consult_hook(session, &progress, cancel).await?;
        }

        let offset = *pos;
        let response = or_cancelled(cancel, || cancelled_at(offset), channel.upload_finish())
            .await?;
        if !response.is_success() {
            return Err(Error::TransferAborted {
                offset,
                reason: format!(
                    "proxy rejected the upload with status {}",
                    response.status
                ),
            });
        }
        Ok(())
    }

    /// Let the hook see `progress` and pause if it asks to. A pause requested
    /// once every byte has moved is ignored.
    async fn consult_hook(
        &mut self,
        session: &mut TransferSession<C>,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let fraction = progress.fraction();
        let Some(request) = self.hook.as_mut().and_then(|h| h.on_progress(fraction)) else {
            return Ok(());
        };
        if progress.bytes_transferred >= progress.total_size {
            tracing::debug!("Ignoring pause request after the last chunk");
            return Ok(());
        }

        self.set_state(EngineState::Paused);
        let controller = PauseResumeController::new(self.config.polling);
        or_cancelled(
            cancel,
            || Error::Cancelled,
            controller.pause_and_resume(session, request.settle),
        )
        .await?;
        self.set_state(EngineState::Active);
        Ok(())
    }

    /// Finalize, then close, then report.
    async fn finish(
        &mut self,
        transfer_id: Uuid,
        mut session: TransferSession<C>,
        channel: Option<K::Channel>,
        result: Result<()>,
        pos: u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<TransferOutcome, TransferFailure> {
        if result.is_err() && cancel.is_cancelled() {
            if let Err(e) = session.cancel().await {
                tracing::warn!("Failed to cancel session: {e}");
            }
        }

        session.finalize().await;
        if let Some(mut channel) = channel {
            channel.close().await;
        }

        let elapsed = self.progress_rx.borrow().started_at.elapsed();
        match result {
            Ok(()) => {
                self.set_state(EngineState::Completed);
                let outcome = TransferOutcome {
                    transfer_id,
                    session_id: session.id().to_string(),
                    direction: session.direction(),
                    bytes_transferred: pos,
                    elapsed,
                    finished_at: Utc::now(),
                };
                tracing::info!("{outcome} in {:.1}s", elapsed.as_secs_f64());
                Ok(outcome)
            }
            Err(error) => {
                self.set_state(EngineState::Failed);
                tracing::error!(bytes = pos, "Transfer failed: {error}");
                Err(TransferFailure::new(error, pos))
            }
        }
    }

    fn set_state(&self, state: EngineState) {
        self.progress_tx.send_modify(|p| p.state = state);
    }

    fn publish(&self, bytes: u64) -> TransferProgress {
        self.progress_tx.send_modify(|p| {
            p.bytes_transferred = bytes;
            let secs = p.started_at.elapsed().as_secs_f64();
            if secs > 0.0 {
                p.speed_bps = (bytes as f64 / secs) as u64;
            }
        });
        self.progress_rx.borrow().clone()
    }
}

/// Open an upload source and settle its size.
async fn open_source(path: &Path, declared: Option<u64>) -> Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        Error::InvalidInput(format!("cannot open {}: {e}", path.display()))
    })?;
    let size = match declared {
        Some(size) => size,
        None => file.metadata().await?.len(),
    };
    Ok((file, size))
}

/// Run `fut` unless `cancel` fires first.
async fn or_cancelled<T, F>(
    cancel: &CancellationToken,
    on_cancel: impl FnOnce() -> Error,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(on_cancel()),
        result = fut => result,
    }
}

fn cancelled_at(offset: u64) -> Error {
    Error::TransferAborted {
        offset,
        reason: "transfer cancelled".to_string(),
    }
}

fn completion(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    }
}
