//! Common test utilities for `imgxfer` integration tests.
//!
//! Test doubles for the control plane and the proxy channel. The fake
//! control plane counts every call and plays scripted phase sequences; the
//! recording channel logs every range it serves and hashes every byte it is
//! sent. Both append to one shared event log so ordering can be asserted.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use imgxfer_core::proxy::{ChannelConnector, ChunkResponse, DataChannel};
use imgxfer_core::session::{
    ControlPlane, Direction, ImageInfo, ImageRef, Phase, SessionInfo, SignedTicket,
};
use imgxfer_core::{Error, Result};

/// One MiB.
pub const MIB: u64 = 1024 * 1024;

/// Proxy URL the fake control plane hands out.
pub const PROXY_URL: &str = "https://proxy.test:54323/images/transfer-1";

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that `secs` whole seconds of (paused) time passed since `started`.
pub fn assert_elapsed(started: Instant, secs: u64) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(secs) && elapsed < Duration::from_secs(secs + 1),
        "expected {secs}s, got {elapsed:?}"
    );
}

/// Call counters of the fake control plane.
#[derive(Debug, Default)]
pub struct Calls {
    pub create: AtomicUsize,
    pub get: AtomicUsize,
    pub extend: AtomicUsize,
    pub pause: AtomicUsize,
    pub resume: AtomicUsize,
    pub finalize: AtomicUsize,
    pub cancel: AtomicUsize,
    pub image_info: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Read a counter.
pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[derive(Debug)]
struct FakeState {
    phase: Phase,
    script: VecDeque<Phase>,
    after_create: Option<Vec<Phase>>,
    init_polls: usize,
    pause_lag: usize,
    pause_sticks: bool,
    resume_lag: usize,
    resume_sticks: bool,
    fail_create: bool,
    fail_finalize: bool,
    image_size: u64,
    lease: Option<Duration>,
    last_extend: Instant,
}

/// In-memory control plane with scripted phases.
#[derive(Debug)]
pub struct FakeControlPlane {
    pub calls: Calls,
    state: Mutex<FakeState>,
    events: Mutex<Vec<String>>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeControlPlane {
    /// A control plane whose sessions become ready on the first poll.
    pub fn new() -> Self {
        Self {
            calls: Calls::default(),
            state: Mutex::new(FakeState {
                phase: Phase::Initializing,
                script: VecDeque::new(),
                after_create: None,
                init_polls: 0,
                pause_lag: 0,
                pause_sticks: false,
                resume_lag: 0,
                resume_sticks: false,
                fail_create: false,
                fail_finalize: false,
                image_size: 0,
                lease: None,
                last_extend: Instant::now(),
            }),
            events: Mutex::new(Vec::new()),
        }
    }

    fn with_state(self, f: impl FnOnce(&mut FakeState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    /// Stay `initializing` for `polls` queries before `transferring`.
    pub fn initializing_for(self, polls: usize) -> Self {
        self.with_state(|s| s.init_polls = polls)
    }

    /// Play exactly these phases after creation, then repeat the last.
    pub fn phases_after_create(self, phases: Vec<Phase>) -> Self {
        self.with_state(|s| s.after_create = Some(phases))
    }

    /// Report `transferring` for `polls` queries after a pause request.
    pub fn pause_lag(self, polls: usize) -> Self {
        self.with_state(|s| s.pause_lag = polls)
    }

    /// Never apply pause requests.
    pub fn ignore_pause(self) -> Self {
        self.with_state(|s| s.pause_sticks = true)
    }

    /// Report `resuming` for `polls` queries after a resume request.
    pub fn resume_lag(self, polls: usize) -> Self {
        self.with_state(|s| s.resume_lag = polls)
    }

    /// Stay `resuming` forever after a resume request.
    pub fn stuck_resuming(self) -> Self {
        self.with_state(|s| s.resume_sticks = true)
    }

    /// Refuse to create sessions.
    pub fn fail_create(self) -> Self {
        self.with_state(|s| s.fail_create = true)
    }

    /// Fail every finalize call.
    pub fn fail_finalize(self) -> Self {
        self.with_state(|s| s.fail_finalize = true)
    }

    /// Size reported by `image_info`.
    pub fn image_size(self, size: u64) -> Self {
        self.with_state(|s| s.image_size = size)
    }

    /// Expire the session `lease` after the last renewal.
    pub fn lease(self, lease: Duration) -> Self {
        self.with_state(|s| s.lease = Some(lease))
    }

    /// Whether the session lease has run out.
    pub fn lease_expired(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .lease
            .is_some_and(|lease| state.last_extend.elapsed() > lease)
    }

    /// Record an event in the shared log.
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    /// Snapshot of the shared event log.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn info(&self, phase: Phase) -> SessionInfo {
        let ready = phase != Phase::Initializing;
        SessionInfo {
            id: "transfer-1".to_string(),
            phase,
            proxy_url: if ready { PROXY_URL.to_string() } else { String::new() },
            signed_ticket: if ready {
                SignedTicket::new("ticket-1")
            } else {
                SignedTicket::default()
            },
        }
    }
}

impl ControlPlane for FakeControlPlane {
    async fn create_session(&self, image: &ImageRef, direction: Direction) -> Result<SessionInfo> {
        bump(&self.calls.create);
        self.record(format!("create {direction}"));

        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(Error::ControlPlane(format!("{image} not found")));
        }
        state.phase = Phase::Initializing;
        state.script = match state.after_create.clone() {
            Some(phases) => phases.into(),
            None => {
                let mut script: VecDeque<Phase> =
                    std::iter::repeat_n(Phase::Initializing, state.init_polls).collect();
                script.push_back(Phase::Transferring);
                script
            }
        };
        state.last_extend = Instant::now();
        Ok(self.info(Phase::Initializing))
    }

    async fn get_session(&self, _id: &str) -> Result<SessionInfo> {
        bump(&self.calls.get);
        let phase = {
            let mut state = self.state.lock().unwrap();
            if let Some(next) = state.script.pop_front() {
                state.phase = next;
            }
            state.phase
        };
        Ok(self.info(phase))
    }

    async fn extend_session(&self, _id: &str) -> Result<()> {
        bump(&self.calls.extend);
        self.state.lock().unwrap().last_extend = Instant::now();
        Ok(())
    }

    async fn pause_session(&self, _id: &str) -> Result<()> {
        bump(&self.calls.pause);
        self.record("pause");
        let mut state = self.state.lock().unwrap();
        let mut script: VecDeque<Phase> =
            std::iter::repeat_n(Phase::Transferring, state.pause_lag).collect();
        if !state.pause_sticks {
            script.push_back(Phase::PausedUser);
        }
        state.script = script;
        Ok(())
    }

    async fn resume_session(&self, _id: &str) -> Result<()> {
        bump(&self.calls.resume);
        self.record("resume");
        let mut state = self.state.lock().unwrap();
        let mut script: VecDeque<Phase> =
            std::iter::repeat_n(Phase::Resuming, state.resume_lag).collect();
        script.push_back(if state.resume_sticks {
            Phase::Resuming
        } else {
            Phase::Transferring
        });
        state.script = script;
        Ok(())
    }

    async fn finalize_session(&self, _id: &str) -> Result<()> {
        bump(&self.calls.finalize);
        self.record("finalize");
        let mut state = self.state.lock().unwrap();
        if state.fail_finalize {
            return Err(Error::ControlPlane("finalize refused".to_string()));
        }
        state.script.clear();
        state.phase = Phase::Finalized;
        Ok(())
    }

    async fn cancel_session(&self, _id: &str) -> Result<()> {
        bump(&self.calls.cancel);
        self.record("cancel");
        Ok(())
    }

    async fn image_info(&self, _image: &ImageRef) -> Result<ImageInfo> {
        bump(&self.calls.image_info);
        let size = self.state.lock().unwrap().image_size;
        Ok(ImageInfo {
            provisioned_size: size,
            actual_size: size,
            format: "raw".to_string(),
            storage_domain_id: Some("sd-1".to_string()),
        })
    }
}

/// What the recording channel saw.
#[derive(Debug, Default)]
pub struct ChannelLog {
    /// Every download range requested, inclusive
    pub ranges: Vec<(u64, u64)>,
    /// Declared upload size
    pub upload_declared: Option<u64>,
    /// Bytes received on the upload
    pub uploaded: u64,
    /// Sizes of the upload writes
    pub upload_writes: usize,
    hasher: Sha256,
    /// Tickets presented on connect
    pub tickets: Vec<String>,
}

impl ChannelLog {
    /// SHA-256 hex of everything uploaded so far.
    pub fn uploaded_digest(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }
}

/// How the recording channel behaves.
#[derive(Debug, Clone)]
pub struct ChannelScript {
    /// Bytes to serve for downloads; zeros if absent
    pub image: Option<Arc<Vec<u8>>>,
    /// Fail the chunk starting at this offset
    pub fail_at: Option<u64>,
    /// Status used for the failing chunk
    pub fail_status: u16,
    /// Serve a short body for the chunk starting at this offset
    pub short_at: Option<u64>,
    /// Final upload status
    pub upload_status: u16,
    /// Simulated time per operation
    pub latency: Duration,
    /// Refuse connections
    pub refuse: bool,
}

impl Default for ChannelScript {
    fn default() -> Self {
        Self {
            image: None,
            fail_at: None,
            fail_status: 500,
            short_at: None,
            upload_status: 200,
            latency: Duration::ZERO,
            refuse: false,
        }
    }
}

/// Connector that hands out [`RecordingChannel`]s.
#[derive(Debug, Clone)]
pub struct RecordingConnector {
    pub control: Arc<FakeControlPlane>,
    pub log: Arc<Mutex<ChannelLog>>,
    pub script: ChannelScript,
    pub connects: Arc<AtomicUsize>,
}

impl RecordingConnector {
    pub fn new(control: Arc<FakeControlPlane>, script: ChannelScript) -> Self {
        Self {
            control,
            log: Arc::new(Mutex::new(ChannelLog::default())),
            script,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.log.lock().unwrap().ranges.clone()
    }
}

impl ChannelConnector for RecordingConnector {
    type Channel = RecordingChannel;

    async fn connect(&self, proxy_url: &str, ticket: &SignedTicket) -> Result<RecordingChannel> {
        bump(&self.connects);
        if self.script.refuse {
            return Err(Error::Connection(format!("{proxy_url}: connection refused")));
        }
        self.log.lock().unwrap().tickets.push(ticket.as_str().to_string());
        self.control.record("connect");
        Ok(RecordingChannel {
            control: Arc::clone(&self.control),
            log: Arc::clone(&self.log),
            script: self.script.clone(),
            closed: false,
        })
    }
}

/// In-memory data channel.
///
/// When the control plane has a lease configured, every operation after the
/// lease runs out is rejected the way an expired ticket is.
#[derive(Debug)]
pub struct RecordingChannel {
    control: Arc<FakeControlPlane>,
    log: Arc<Mutex<ChannelLog>>,
    script: ChannelScript,
    closed: bool,
}

impl RecordingChannel {
    async fn tick(&self, offset: u64) -> Result<()> {
        if !self.script.latency.is_zero() {
            tokio::time::sleep(self.script.latency).await;
        }
        if self.closed {
            return Err(Error::TransferAborted {
                offset,
                reason: "channel is closed".to_string(),
            });
        }
        Ok(())
    }
}

impl DataChannel for RecordingChannel {
    async fn download_chunk(&mut self, start: u64, end: u64) -> Result<ChunkResponse> {
        self.tick(start).await?;
        self.log.lock().unwrap().ranges.push((start, end));
        self.control.record(format!("chunk {start}-{end}"));

        if self.control.lease_expired() {
            return Ok(ChunkResponse {
                status: 403,
                body: Vec::new(),
            });
        }
        if self.script.fail_at == Some(start) {
            return Ok(ChunkResponse {
                status: self.script.fail_status,
                body: b"proxy error".to_vec(),
            });
        }
        if self.script.short_at == Some(start) {
            return Err(Error::TransferAborted {
                offset: start,
                reason: "proxy closed the connection mid-chunk".to_string(),
            });
        }

        let body = match &self.script.image {
            Some(image) => image[start as usize..=end as usize].to_vec(),
            None => vec![0u8; (end - start + 1) as usize],
        };
        Ok(ChunkResponse { status: 206, body })
    }

    async fn upload_prepare(&mut self, total_size: u64) -> Result<()> {
        self.tick(0).await?;
        self.log.lock().unwrap().upload_declared = Some(total_size);
        Ok(())
    }

    async fn upload_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let offset = self.log.lock().unwrap().uploaded;
        self.tick(offset).await?;
        if self.control.lease_expired() {
            return Err(Error::TransferAborted {
                offset,
                reason: "ticket expired".to_string(),
            });
        }

        let mut log = self.log.lock().unwrap();
        log.uploaded += bytes.len() as u64;
        log.upload_writes += 1;
        log.hasher.update(bytes);
        Ok(())
    }

    async fn upload_finish(&mut self) -> Result<ChunkResponse> {
        let offset = self.log.lock().unwrap().uploaded;
        self.tick(offset).await?;
        Ok(ChunkResponse {
            status: self.script.upload_status,
            body: Vec::new(),
        })
    }

    async fn close(&mut self) {
        self.closed = true;
        self.control.record("close");
    }
}
