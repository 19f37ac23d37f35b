use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;

use mnema::config::MnemaConfig;
use mnema::memory::MemoryManager;

/// Rebuild the derived indexes from the record store, with a progress bar.
pub async fn rebuild(config: MnemaConfig, concurrency: Option<usize>, timeout_secs: Option<u64>) -> Result<()> {
    let manager = MemoryManager::open(config).await?;
    let total = manager.stats(None).await?.total_records;
    if total == 0 {
        println!("No records to rebuild.");
        manager.shutdown().await?;
        return Ok(());
    }

    let pb = super::progress_bar(total);
    let tick = pb.clone();
    let mut options = manager.rebuild_options();
    if let Some(n) = concurrency {
        options.concurrency = n;
    }
    options.timeout = timeout_secs.map(Duration::from_secs);
    options.cancel = super::cancel_on_ctrl_c();
    options.progress = Some(Arc::new(move |n| tick.inc(n)));

    println!("Rebuilding indexes for {total} records...");
    let result = manager.rebuild_indexes(options).await;
    pb.finish_and_clear();
    manager.shutdown().await?;
    let report = result?;

    println!("Rebuild complete:");
    println!("  Scanned:          {}", report.scanned);
    println!("  Indexed:          {}", report.indexed);
    println!("  Failed:           {}", report.failed);
    if report.stale_removed > 0 {
        println!("  Stale removed:    {}", report.stale_removed);
    }
    for error in &report.errors {
        println!("    {error}");
    }
    if report.cancelled {
        println!("  (cancelled)");
    }
    Ok(())
}

/// Delete session records that have not been updated for `older_than_days`.
pub async fn prune(config: MnemaConfig, older_than_days: i64) -> Result<()> {
    if older_than_days < 0 {
        bail!("--older-than-days must be >= 0");
    }
    let manager = MemoryManager::open(config).await?;
    let cutoff = chrono::Utc::now() - chrono::Duration::days(older_than_days);
    let report = manager.prune_sessions(cutoff).await?;
    manager.shutdown().await?;

    println!("Session prune complete:");
    println!("  Stale records:    {}", report.candidates);
    println!("  Pruned:           {}", report.pruned);
    if report.changed > 0 {
        println!("  Changed, kept:    {}", report.changed);
    }
    if report.skipped > 0 {
        println!("  Skipped:          {} (retry later)", report.skipped);
    }
    Ok(())
}
