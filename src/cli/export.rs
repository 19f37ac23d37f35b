use anyhow::Result;

use mnema::config::MnemaConfig;
use mnema::memory::transfer::TransferOptions;
use mnema::memory::MemoryManager;

/// Export records and the graph as JSON Lines to stdout.
pub async fn export(config: MnemaConfig, owner: Option<String>) -> Result<()> {
    let page_size = config.indexing.page_size;
    let manager = MemoryManager::open(config).await?;

    let options = TransferOptions {
        owner,
        page_size,
        cancel: super::cancel_on_ctrl_c(),
        ..Default::default()
    };
    let mut stdout = tokio::io::stdout();
    let report = manager.export(&mut stdout, &options).await?;
    manager.shutdown().await?;

    eprintln!(
        "Exported {} records ({} with vectors), {} nodes and {} edges{}.",
        report.memories,
        report.vectors,
        report.nodes,
        report.edges,
        if report.cancelled { " before cancellation" } else { "" }
    );
    Ok(())
}
