//! Checksums for round-trip verification.
//!
//! Digests are SHA-256 in lowercase hex, the same text `sha256sum` prints,
//! so a local digest compares directly with one taken on the storage host.
//!
//! The remote side is reached through a [`HostExecutor`]. For block storage
//! the image's logical volume is activated before hashing and deactivated
//! afterwards, even if hashing fails.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::VerifyConfig;
use crate::error::{Error, Result};
use crate::session::ImageRef;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Hash a local file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn local_checksum(path: &Path) -> Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let digest = checksum_reader(file).await?;
    tracing::debug!(path = %path.display(), %digest, "Computed local checksum");
    Ok(digest)
}

/// Hash everything `reader` yields.
///
/// # Errors
///
/// Returns an error if reading fails.
pub async fn checksum_reader<R: AsyncRead + Unpin>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digests taken on both ends of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    /// Digest of the data before the transfer
    pub source: String,
    /// Digest of the data after the transfer
    pub destination: String,
}

impl ChecksumRecord {
    /// Pair two digests.
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Compare the digests, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityMismatch`] if they differ.
    pub fn verify(&self) -> Result<()> {
        if self.source.eq_ignore_ascii_case(&self.destination) {
            Ok(())
        } else {
            Err(Error::IntegrityMismatch {
                source_digest: self.source.clone(),
                destination_digest: self.destination.clone(),
            })
        }
    }
}

/// Where a storage domain keeps its images on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendDescriptor {
    /// Each image is a logical volume in this volume group
    Block {
        /// Volume group name (usually the storage domain id)
        volume_group: String,
    },
    /// Each image is a file in this directory
    File {
        /// Directory holding the image files
        image_dir: PathBuf,
    },
}

impl BackendDescriptor {
    /// Host path of `image` on this backend.
    #[must_use]
    pub fn image_path(&self, image: &ImageRef) -> String {
        match self {
            Self::Block { volume_group } => format!("/dev/{volume_group}/{}", image.id()),
            Self::File { image_dir } => image_dir.join(image.id()).display().to_string(),
        }
    }
}

/// Result of a command run on the storage host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `None` if the process was killed by a signal
    pub status: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Exit status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.status, Some(0))
    }
}

/// Runs commands on the storage host.
pub trait HostExecutor: Send + Sync {
    /// Run `argv` to completion. A non-zero exit is not an error here.
    fn run(&self, argv: &[String]) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// [`HostExecutor`] that goes through the `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: String,
    destination: String,
    port: Option<u16>,
}

impl SshExecutor {
    /// Run commands as `user` on `host`.
    pub fn new(host: impl AsRef<str>, user: impl AsRef<str>) -> Self {
        Self {
            program: "ssh".to_string(),
            destination: format!("{}@{}", user.as_ref(), host.as_ref()),
            port: None,
        }
    }

    /// Build from the `[verify]` section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if no host is configured.
    pub fn from_config(config: &VerifyConfig) -> Result<Self> {
        let host = config.host.as_deref().ok_or_else(|| Error::InvalidConfig {
            key: "verify.host".to_string(),
            reason: "required for remote checksums".to_string(),
        })?;
        let mut executor = Self::new(host, &config.user).with_program(&config.ssh_program);
        executor.port = config.port;
        Ok(executor)
    }

    /// Use a different ssh binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Connect to a non-default port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Arguments passed to the ssh program for `argv`.
    #[must_use]
    pub fn ssh_args(&self, argv: &[String]) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.destination.clone());
        args.push("--".to_string());
        args.extend(argv.iter().cloned());
        args
    }
}

impl HostExecutor for SshExecutor {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        tracing::debug!(
            destination = %self.destination,
            command = %argv.join(" "),
            "Running host command"
        );

        let output = tokio::process::Command::new(&self.program)
            .args(self.ssh_args(argv))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::HostCommand(format!("failed to start {}: {e}", self.program)))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Computes digests of backend images on the storage host.
#[derive(Debug, Clone)]
pub struct IntegrityVerifier<E> {
    executor: E,
}

impl<E: HostExecutor> IntegrityVerifier<E> {
    /// Create a verifier over a host executor.
    pub const fn new(executor: E) -> Self {
        Self { executor }
    }

    /// The executor commands run through.
    pub const fn executor(&self) -> &E {
        &self.executor
    }

    /// Hash `image` where `backend` stores it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HostCommand`] if activation or hashing fails or the
    /// output is not a digest.
    pub async fn remote_checksum(
        &self,
        backend: &BackendDescriptor,
        image: &ImageRef,
    ) -> Result<String> {
        let path = backend.image_path(image);

        let digest = match backend {
            BackendDescriptor::Block { .. } => {
                self.checked(&lvchange("-ay", &path)).await?;
                let hashed = self.hash(&path).await;
                if let Err(e) = self.checked(&lvchange("-an", &path)).await {
                    tracing::warn!(%path, "Failed to deactivate logical volume: {e}");
                }
                hashed?
            }
            BackendDescriptor::File { .. } => self.hash(&path).await?,
        };

        tracing::info!(%image, %digest, "Computed remote checksum");
        Ok(digest)
    }

    /// Hash the local file and the backend image and compare.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityMismatch`] if the digests differ, or any
    /// error from either side.
    pub async fn verify_round_trip(
        &self,
        local: &Path,
        backend: &BackendDescriptor,
        image: &ImageRef,
    ) -> Result<ChecksumRecord> {
        let record = ChecksumRecord::new(
            local_checksum(local).await?,
            self.remote_checksum(backend, image).await?,
        );
        record.verify()?;
        Ok(record)
    }

    async fn hash(&self, path: &str) -> Result<String> {
        let output = self
            .checked(&["sha256sum".to_string(), path.to_string()])
            .await?;
        parse_sha256sum(&output.stdout)
    }

    async fn checked(&self, argv: &[String]) -> Result<CommandOutput> {
        let output = self.executor.run(argv).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::HostCommand(format!(
                "'{}' exited with {}: {}",
                argv.join(" "),
                output
                    .status
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                output.stderr.trim()
            )))
        }
    }
}

fn lvchange(flag: &str, path: &str) -> Vec<String> {
    vec!["lvchange".to_string(), flag.to_string(), path.to_string()]
}

/// Extract the digest from `sha256sum` output (`<hex>  <path>`).
fn parse_sha256sum(stdout: &str) -> Result<String> {
    let digest = stdout.split_whitespace().next().unwrap_or_default();
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(digest.to_ascii_lowercase())
    } else {
        Err(Error::HostCommand(format!(
            "unexpected sha256sum output: '{}'",
            stdout.trim()
        )))
    }
}
