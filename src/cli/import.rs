use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::BufReader;

use mnema::config::MnemaConfig;
use mnema::memory::transfer::TransferOptions;
use mnema::memory::MemoryManager;

/// Import a JSON Lines file produced by `mnema export`.
///
/// Records keep their ids and are upserted by `(owner, scope, key)`. Lines
/// that fail to parse or validate are reported and skipped.
pub async fn import(config: MnemaConfig, file: &Path, timeout_secs: Option<u64>) -> Result<()> {
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("failed to open import file: {}", file.display()))?;

    let manager = MemoryManager::open(config).await?;
    let options = TransferOptions {
        timeout: timeout_secs.map(Duration::from_secs),
        cancel: super::cancel_on_ctrl_c(),
        ..Default::default()
    };
    let report = manager.import(BufReader::new(handle), &options).await?;
    manager.shutdown().await?;

    println!("Import complete:");
    println!("  Lines read:       {}", report.lines);
    println!("  Records:          {}", report.memories);
    println!("  Graph nodes:      {}", report.nodes);
    println!("  Graph edges:      {}", report.edges);
    if report.failed > 0 {
        println!("  Failed:           {}", report.failed);
        for error in &report.errors {
            println!("    {error}");
        }
    }
    if report.cancelled {
        println!("  (cancelled before the end of the file)");
    }
    Ok(())
}
