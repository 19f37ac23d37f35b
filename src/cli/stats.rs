use anyhow::Result;

use mnema::config::MnemaConfig;
use mnema::memory::MemoryManager;

use super::format_bytes;

/// Display memory statistics in the terminal.
pub async fn stats(config: MnemaConfig, owner: Option<&str>, json: bool) -> Result<()> {
    let manager = MemoryManager::open(config).await?;
    let response = manager.stats(owner).await?;
    manager.shutdown().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    println!("  Total records:       {}", response.total_records);
    println!();

    println!("By Scope:");
    for (scope, count) in &response.by_scope {
        println!("  {:<12} {}", scope, count);
    }
    println!();

    println!("By Owner:");
    for (owner, count) in &response.by_owner {
        println!("  {:<12} {}", owner, count);
    }
    println!();

    if !response.top_tags.is_empty() {
        println!("Top Tags:");
        for (tag, count) in &response.top_tags {
            println!("  {:<12} {}", tag, count);
        }
        println!();
    }

    println!("Graph nodes:           {}", response.graph_nodes);
    println!("Live edges:            {}", response.live_edges);
    println!("Orphaned edges:        {}", response.orphaned_edges);
    println!("Vectors ({}):     {}", response.vector_backend, response.vectors);
    println!("Database size:         {}", format_bytes(response.db_size_bytes));

    if let Some(ref oldest) = response.oldest_record {
        println!("Oldest record:         {oldest}");
    }
    if let Some(ref newest) = response.newest_record {
        println!("Newest record:         {newest}");
    }

    Ok(())
}
