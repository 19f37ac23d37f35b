//! CLI `doctor` command: run diagnostics and print a health report.

use anyhow::{Context, Result};

use mnema::config::MnemaConfig;
use mnema::memory::MemoryManager;

use super::format_bytes;

/// Run database and graph diagnostics and print a health report.
pub async fn doctor(config: MnemaConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Nothing has been stored yet.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let manager = MemoryManager::open(config)
        .await
        .context("failed to open database (may be corrupt)")?;
    let report = manager.health().await.context("failed to run health check")?;
    manager.shutdown().await?;
    let db = &report.database;

    println!("mnema Health Report");
    println!("===================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", db.schema_version);
    println!(
        "Vector index:      {} ({} dims, {} vectors)",
        report.vector_backend, report.vector_dimensions, report.vectors
    );
    if let Some(ref version) = report.vector_version {
        println!("sqlite-vec:        {version}");
    }
    if let Some(stored) = db.vector_dimensions {
        if stored != report.vector_dimensions {
            println!("  WARNING: database was created with {stored} dimensions.");
        }
    }
    println!();
    println!("Row counts:");
    println!("  Records:         {}", db.memory_count);
    println!("  Graph nodes:     {}", db.node_count);
    println!("  Graph edges:     {} ({} orphaned)", db.edge_count, db.orphaned_edge_count);
    println!("  Audit log:       {}", db.log_count);
    println!();
    if db.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", db.integrity_details);
    }
    if report.graph.is_ok() {
        println!("Graph check:       PASSED ({} live edges)", report.graph.edges_checked);
    } else {
        println!(
            "Graph check:       {} live edge(s) point at missing nodes",
            report.graph.dangling.len()
        );
    }

    if !db.integrity_ok {
        println!();
        println!("Recovery steps:");
        println!("  1. Restore from a backup: cp backup.db ~/.mnema/memory.db");
        println!("  2. Or export from a good copy and reimport:");
        println!("     mnema export > backup.jsonl");
        println!("     mnema import backup.jsonl");
    }

    Ok(())
}
