//! Verify command implementation.

use gesden_sync_engine::JournalRecord;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Lines checked.
    pub records_checked: usize,
    /// Lines that parsed as journal records.
    pub valid_records: usize,
    /// Lines that failed to parse (excluding a truncated tail).
    pub corrupt_records: usize,
    /// Whether the final line is a truncated crash artifact.
    pub truncated_tail: bool,
    /// Errors found, with line numbers.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn new() -> Self {
        Self {
            records_checked: 0,
            valid_records: 0,
            corrupt_records: 0,
            truncated_tail: false,
            errors: Vec::new(),
        }
    }

    /// Returns true if the journal would replay cleanly.
    pub fn is_ok(&self) -> bool {
        self.corrupt_records == 0
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying journal at {}", path.display());

    let result = verify(path)?;
    println!("  Records checked: {}", result.records_checked);
    println!("  Valid:           {}", result.valid_records);
    println!("  Corrupt:         {}", result.corrupt_records);
    if result.truncated_tail {
        println!("  Note: trailing line is truncated (crash artifact, dropped on replay)");
    }
    for error in &result.errors {
        println!("  {error}");
    }

    if result.is_ok() {
        println!("OK");
        Ok(())
    } else {
        Err("journal is corrupt and will not replay".into())
    }
}

/// Checks every journal line.
pub fn verify(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
    let last_index = lines.len().saturating_sub(1);

    let mut result = VerifyResult::new();
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        result.records_checked += 1;
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(_) => result.valid_records += 1,
            Err(e) if index == last_index => {
                result.truncated_tail = true;
                result
                    .errors
                    .push(format!("line {}: truncated tail: {e}", index + 1));
            }
            Err(e) => {
                result.corrupt_records += 1;
                result.errors.push(format!("line {}: {e}", index + 1));
            }
        }
    }
    Ok(result)
}
