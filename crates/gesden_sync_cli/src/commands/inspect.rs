//! Inspect command implementation.

use gesden_sync_engine::journal;
use gesden_sync_protocol::OperationStatus;
use serde::Serialize;
use std::path::Path;

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Journal file size in bytes.
    pub file_size: u64,
    /// Operations pending after recovery.
    pub pending_operations: usize,
    /// Operations that were in flight at the time of the snapshot.
    pub in_flight_operations: usize,
    /// Terminal operations still recorded (pre-compaction audit trail).
    pub terminal_operations: u64,
    /// Next operation id the engine would assign.
    pub next_op_id: u64,
    /// Confirmed change feed positions per store.
    pub watermarks: Vec<WatermarkLine>,
    /// Records with a last-synced base snapshot.
    pub base_snapshots: usize,
}

/// One watermark line.
#[derive(Debug, Serialize)]
pub struct WatermarkLine {
    /// Store side.
    pub source: String,
    /// Highest consumed sequence.
    pub sequence: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("no journal found at {}", path.display()).into());
    }

    let state = journal::replay(path)?;
    let file_size = std::fs::metadata(path)?.len();

    let result = InspectResult {
        path: path.display().to_string(),
        file_size,
        pending_operations: state
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .count(),
        in_flight_operations: state
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::InFlight)
            .count(),
        terminal_operations: state.terminal_count,
        next_op_id: state.next_op_id,
        watermarks: state
            .watermarks
            .iter()
            .map(|(source, sequence)| WatermarkLine {
                source: source.to_string(),
                sequence: *sequence,
            })
            .collect(),
        base_snapshots: state.bases.len(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        "text" => print_text(&result),
        other => return Err(format!("unknown format: {other}").into()),
    }
    Ok(())
}

fn print_text(result: &InspectResult) {
    println!("Journal: {}", result.path);
    println!("  File size:           {} bytes", result.file_size);
    println!("  Pending operations:  {}", result.pending_operations);
    println!("  In-flight (stale):   {}", result.in_flight_operations);
    println!("  Terminal (audit):    {}", result.terminal_operations);
    println!("  Next operation id:   {}", result.next_op_id);
    println!("  Base snapshots:      {}", result.base_snapshots);
    if result.watermarks.is_empty() {
        println!("  Watermarks:          none");
    } else {
        println!("  Watermarks:");
        for w in &result.watermarks {
            println!("    {:<12} {}", w.source, w.sequence);
        }
    }
}
