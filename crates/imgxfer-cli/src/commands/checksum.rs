//! Checksum command implementation.

use anyhow::{Context, Result};

use imgxfer_core::integrity::local_checksum;

use super::{ChecksumArgs, GlobalArgs};

/// Print the SHA-256 digest of a local file, `sha256sum` style.
pub async fn run(args: ChecksumArgs, global: &GlobalArgs) -> Result<()> {
    let digest = local_checksum(&args.path)
        .await
        .with_context(|| format!("Failed to hash {}", args.path.display()))?;

    if global.json {
        let output = serde_json::json!({
            "path": args.path.display().to_string(),
            "sha256": digest,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{digest}  {}", args.path.display());
    }
    Ok(())
}
