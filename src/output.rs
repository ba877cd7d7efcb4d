//! Output formatting and persistence for fetch records.
//!
//! Supports pretty-printing, JSON serialization, and CSV append.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::Path;

/// Logs a record using Rust's debug pretty-print format.
pub fn print_pretty(record: &impl std::fmt::Debug) {
    debug!("{:#?}", record);
}

/// Logs a record as pretty-printed JSON.
pub fn print_json(record: &impl Serialize) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

/// Appends a record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, record: &impl Serialize) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}
