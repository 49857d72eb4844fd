// src/export.rs - Delimited export of the displayed rows

use crate::config::ExportConfig;
use crate::error::{FeedError, Result};
use crate::event::AlertEvent;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Fixed column order of every export
pub const EXPORT_COLUMNS: [&str; 6] = ["id", "time", "message", "priority", "stationID", "stationName"];

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Writes alarm rows as delimited text
#[derive(Debug, Clone, Copy)]
pub struct Exporter {
    delimiter: u8,
}

impl Default for Exporter {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl Exporter {
    pub fn new(delimiter: char) -> Result<Self> {
        if !delimiter.is_ascii() {
            return Err(FeedError::Config(format!("delimiter '{}' is not ASCII", delimiter)));
        }
        Ok(Self {
            delimiter: delimiter as u8,
        })
    }

    pub fn from_config(config: &ExportConfig) -> Result<Self> {
        Self::new(config.delimiter)
    }

    /// Write header plus one record per row. Returns the number of rows.
    pub fn write<W: Write>(&self, rows: &[AlertEvent], writer: W) -> Result<usize> {
        let mut out = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(writer);

        out.write_record(EXPORT_COLUMNS)?;
        for event in rows {
            out.write_record([
                event.id.to_string(),
                event.timestamp.format(TIME_FORMAT).to_string(),
                event.message.clone(),
                event.priority.level().to_string(),
                event.station_id.to_string(),
                event.station_name.clone().unwrap_or_default(),
            ])?;
        }
        out.flush()?;
        Ok(rows.len())
    }

    pub fn write_file(&self, rows: &[AlertEvent], path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)?;
        let written = self.write(rows, file)?;
        info!("Exported {} rows to {}", written, path.display());
        Ok(written)
    }
}
