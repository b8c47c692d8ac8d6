//! # imgxfer Core Library
//!
//! `imgxfer-core` moves virtual-disk image data between a local file and a
//! storage backend. Bulk bytes travel over HTTP(S) through a data-plane
//! proxy; the transfer itself is coordinated with a control-plane session
//! service that hands out the proxy URL and a signed ticket.
//!
//! ## Features
//!
//! - **Session lifecycle**: bounded waits for the session to become ready
//! - **Chunked transfer**: `Range` downloads and streamed `Content-Range` uploads
//! - **Pause/resume**: mid-flight pause with timeout-bounded phase polling
//! - **Lease renewal**: periodic session extension while bytes flow
//! - **Integrity**: SHA-256 checksums of the local file and the backend image
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`engine`] - Chunked transfer engine and progress hooks
//! - [`error`] - Error taxonomy
//! - [`integrity`] - Local and remote checksums
//! - [`pause`] - Pause/resume phase transitions
//! - [`proxy`] - HTTP(S) channel to the data-plane proxy
//! - [`session`] - Control-plane session handle
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use imgxfer_core::config::Config;
//! use imgxfer_core::engine::{TransferEngine, TransferRequest};
//! use imgxfer_core::proxy::TlsProxyConnector;
//! use imgxfer_core::session::{ImageRef, rest::RestControlPlane};
//!
//! let config = Config::load()?;
//! let control = Arc::new(RestControlPlane::from_config(&config.control_plane, auth)?);
//! let connector = TlsProxyConnector::from_config(&config)?;
//! let mut engine = TransferEngine::new(control, connector, config.engine_config());
//!
//! let request = TransferRequest::upload(ImageRef::Disk(disk_id), "disk.qcow2");
//! let outcome = engine.run(&request).await?;
//! println!("{outcome}");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod pause;
pub mod proxy;
pub mod session;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Download chunk size (64 MiB)
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Upload read buffer size (128 KiB)
pub const DEFAULT_UPLOAD_BUFFER_SIZE: usize = 128 * 1024;

/// Interval between lease renewals during an upload, in seconds
pub const DEFAULT_EXTEND_INTERVAL_SECS: u64 = 60;

/// Interval between upload progress reports, in seconds
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 10;

/// Time allowed for a new session to leave the initializing phase, in seconds
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 300;

/// Interval between control-plane phase polls, in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;

/// Time allowed for a pause or resume request to take effect, in seconds
pub const DEFAULT_PHASE_CHANGE_TIMEOUT_SECS: u64 = 60;

/// Time spent paused before resuming, in seconds
pub const DEFAULT_SETTLE_SECS: u64 = 60;

/// Timeout for the TCP connection to the proxy, in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
