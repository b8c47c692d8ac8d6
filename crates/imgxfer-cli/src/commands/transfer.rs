//! Upload and download command implementation.

use std::sync::Arc;

use anyhow::{Context, Result};

use imgxfer_core::config::Config;
use imgxfer_core::engine::{PauseAt, TransferEngine, TransferOutcome, TransferRequest};
use imgxfer_core::integrity::{ChecksumRecord, IntegrityVerifier, SshExecutor};
use imgxfer_core::proxy::TlsProxyConnector;
use imgxfer_core::session::rest::RestControlPlane;
use imgxfer_core::session::{Direction, ImageRef};

use super::{GlobalArgs, TransferArgs};
use crate::ui;

/// Run an upload or download.
pub async fn run(args: TransferArgs, direction: Direction, global: &GlobalArgs) -> Result<()> {
    let config = super::load_config()?;
    let image = args.image();

    let request = match direction {
        Direction::Upload => TransferRequest::upload(image.clone(), &args.path),
        Direction::Download => TransferRequest::download(image.clone(), &args.path),
    };
    let request = match args.size {
        Some(size) => request.with_size(size),
        None => request,
    };

    let control = RestControlPlane::from_config(&config.control_plane, global.auth(&config)?)
        .context("Failed to set up the control-plane client")?;
    let connector =
        TlsProxyConnector::from_config(&config).context("Failed to set up the proxy connector")?;

    let mut engine = TransferEngine::new(Arc::new(control), connector, config.engine_config());
    if let Some(fraction) = global.pause_at {
        let settle = match &global.settle {
            Some(s) => ui::parse_duration(s)
                .with_context(|| format!("Invalid --settle '{s}' (expected e.g. 30s, 2m, 1h)"))?,
            None => config.polling.settle_duration,
        };
        engine = engine.with_hook(PauseAt::new(fraction, settle));
    }

    if global.human() {
        println!();
        println!("imgxfer v{}", imgxfer_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!("  {direction} {image} <-> {}", args.path.display());
        println!();
    }

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling transfer");
            cancel.cancel();
        }
    });

    let progress_handle = global
        .human()
        .then(|| tokio::spawn(ui::display_progress(engine.progress())));

    let result = engine.run(&request).await;

    // Dropping the engine closes the progress channel.
    drop(engine);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(failure) => {
            if global.json {
                let output = serde_json::json!({
                    "status": "failed",
                    "error": failure.error.to_string(),
                    "code": failure.error.code(),
                    "bytes_transferred": failure.bytes_transferred,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else if !global.quiet {
                eprintln!();
                eprintln!("  Transfer failed: {failure}");
                if let Some(hint) = failure.error.suggestion() {
                    eprintln!();
                    for line in hint.lines() {
                        eprintln!("  {line}");
                    }
                }
                eprintln!();
            }
            return Err(failure.into());
        }
    };

    let checksum = if global.verify || config.verify.enabled {
        Some(verify(&config, &args, &image, global).await?)
    } else {
        None
    };

    report(&outcome, checksum.as_ref(), global)
}

async fn verify(
    config: &Config,
    args: &TransferArgs,
    image: &ImageRef,
    global: &GlobalArgs,
) -> Result<ChecksumRecord> {
    let backend = config
        .verify
        .backend
        .as_ref()
        .context("--verify needs a [verify.backend] section in the configuration")?;
    let verifier = IntegrityVerifier::new(SshExecutor::from_config(&config.verify)?);

    if global.human() {
        println!("  Verifying checksums...");
    }

    verifier
        .verify_round_trip(&args.path, backend, image)
        .await
        .context("Checksum verification failed")
}

fn report(
    outcome: &TransferOutcome,
    checksum: Option<&ChecksumRecord>,
    global: &GlobalArgs,
) -> Result<()> {
    if global.json {
        let mut output = serde_json::json!({
            "status": "complete",
            "transfer_id": outcome.transfer_id.to_string(),
            "session_id": outcome.session_id,
            "direction": outcome.direction.to_string(),
            "bytes_transferred": outcome.bytes_transferred,
            "elapsed_secs": outcome.elapsed.as_secs_f64(),
            "finished_at": outcome.finished_at.to_rfc3339(),
        });
        if let Some(record) = checksum {
            output["sha256"] = serde_json::json!(record.source);
        }
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !global.quiet {
        println!();
        println!(
            "  Transfer complete: {} in {}",
            ui::format_size(outcome.bytes_transferred),
            ui::format_elapsed(outcome.elapsed)
        );
        if let Some(record) = checksum {
            println!("  Checksums match: {}", record.source);
        }
        println!();
    }
    Ok(())
}
