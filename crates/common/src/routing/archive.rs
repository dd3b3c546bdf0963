//! Stored (uncompressed) zip archives for multi-file downloads
//!
//! File bodies are already encrypted at rest and decrypted once for delivery,
//! so entries are stored as-is. Entries too large for the classic format are
//! written with ZIP64 extensions.

use std::io::{self, Cursor, Write};

use chrono::{DateTime, Datelike, Timelike, Utc};
use zip::result::{ZipError, ZipResult};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Writes a stored zip archive into memory
pub struct StoredArchive {
    writer: ZipWriter<Cursor<Vec<u8>>>,
}

impl Default for StoredArchive {
    fn default() -> Self {
        Self::new()
    }
}

/// The zip timestamp for `at`; the format cannot express years before 1980
fn modified_time(at: DateTime<Utc>) -> zip::DateTime {
    u16::try_from(at.year())
        .ok()
        .and_then(|year| {
            zip::DateTime::from_date_and_time(
                year,
                at.month() as u8,
                at.day() as u8,
                at.hour() as u8,
                at.minute() as u8,
                at.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

impl StoredArchive {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    /// Append one entry.
    ///
    /// `length` is the size the entry is declared with; it has to match the
    /// data actually written.
    pub fn add_entry(
        &mut self,
        name: &str,
        length: u64,
        data: &[u8],
        modified: DateTime<Utc>,
    ) -> ZipResult<()> {
        if data.len() as u64 != length {
            return Err(ZipError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "entry '{}' declared {} bytes, got {}",
                    name,
                    length,
                    data.len()
                ),
            )));
        }

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(modified_time(modified))
            .large_file(length > u32::MAX as u64);
        self.writer.start_file(name, options)?;
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Write the central directory and return the archive bytes.
    pub fn finish(self) -> ZipResult<Vec<u8>> {
        Ok(self.writer.finish()?.into_inner())
    }
}
