pub mod doctor;
pub mod export;
pub mod import;
pub mod maintenance;
pub mod stats;

use indicatif::{ProgressBar, ProgressStyle};
use mnema::sync::CancelToken;

/// A token that is cancelled when the user presses Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancelToken {
    let token = CancelToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            trigger.cancel();
        }
    });
    token
}

pub fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("  {bar:40.cyan/blue} {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    pb.set_style(style);
    pb
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
