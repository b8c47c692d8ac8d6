//! UI utilities for imgxfer CLI.

use std::io::{self, Write};
use std::time::Duration;

use tokio::sync::watch;

use imgxfer_core::engine::{EngineState, TransferProgress};

/// Format a byte count with binary units.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Parse a duration string like "5m", "30s", or "1h".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(num_str) = s.strip_suffix('m') {
        let num: u64 = num_str.parse().ok()?;
        num.checked_mul(60).map(Duration::from_secs)
    } else if let Some(num_str) = s.strip_suffix('s') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num))
    } else if let Some(num_str) = s.strip_suffix('h') {
        let num: u64 = num_str.parse().ok()?;
        num.checked_mul(3600).map(Duration::from_secs)
    } else {
        None
    }
}

/// Format an elapsed duration as "H:MM:SS" or "M:SS".
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}

/// One progress line, without the leading carriage return.
pub fn progress_line(progress: &TransferProgress) -> String {
    format!(
        "[{:>6.2}%] {} / {} - {}/s",
        progress.percentage(),
        format_size(progress.bytes_transferred),
        format_size(progress.total_size),
        format_size(progress.speed_bps)
    )
}

/// Render progress updates until the transfer ends or the engine goes away.
pub async fn display_progress(mut rx: watch::Receiver<TransferProgress>) {
    let mut last_state = EngineState::Idle;

    loop {
        if rx.changed().await.is_err() {
            break;
        }

        let progress = rx.borrow_and_update().clone();

        if progress.state != last_state {
            last_state = progress.state;

            match progress.state {
                EngineState::Active => {}
                EngineState::Paused => {
                    println!();
                    println!("  Paused, waiting for the backend...");
                }
                EngineState::Completed | EngineState::Failed => break,
                EngineState::Idle => continue,
            }
        }

        if progress.state == EngineState::Active {
            print!("\r  {}    ", progress_line(&progress));
            let _ = io::stdout().flush();
        }
    }

    println!();
}
