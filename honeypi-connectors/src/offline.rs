//! Offline CSV storage
//!
//! Rows are appended to `offline-<channel>.csv` in the ThingSpeak column
//! layout so they can be bulk-uploaded once the Pi is online again:
//!
//! ```text
//! datetime,field1,field2,...,field8,latitude,longitude,elevation,status
//! 2024-05-01 12:00:00,24.5,,41.235,,,,,,,,,
//! ```
//!
//! Keys outside that layout are ignored. The file is kept below
//! [`MAX_FILE_BYTES`] by dropping the oldest rows; the header always stays.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use honeypi_core::{FieldMap, FieldValue};
use log::{debug, info};

use crate::{FieldSink, SinkError};

/// ThingSpeak column layout
pub const CSV_COLUMNS: [&str; 13] = [
    "datetime",
    "field1",
    "field2",
    "field3",
    "field4",
    "field5",
    "field6",
    "field7",
    "field8",
    "latitude",
    "longitude",
    "elevation",
    "status",
];

/// Size above which old rows are dropped
pub const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;

/// Rows dropped per trim
pub const TRIM_ROWS: usize = 10;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Appends each cycle to a per-channel CSV file
#[derive(Debug, Clone)]
pub struct OfflineCsvSink {
    path: PathBuf,
    name: String,
    max_bytes: u64,
}

impl OfflineCsvSink {
    /// Sink writing `offline-<channel_id>.csv` inside `dir`
    pub fn new(dir: impl AsRef<Path>, channel_id: &str) -> Self {
        let file_name = format!("offline-{}.csv", channel_id);
        Self {
            path: dir.as_ref().join(&file_name),
            name: file_name,
            max_bytes: MAX_FILE_BYTES,
        }
    }

    /// Override the trim threshold
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row stamped with `at`
    pub fn append_at(&mut self, fields: &FieldMap, at: NaiveDateTime) -> Result<(), SinkError> {
        self.trim_if_oversized()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        let write_header = file.metadata().map_err(|source| self.io_error(source))?.len() == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            writer.write_record(CSV_COLUMNS)?;
        }
        writer.write_record(row(fields, at))?;
        writer.flush().map_err(|source| self.io_error(source))?;

        debug!("offline row appended to {}", self.path.display());
        Ok(())
    }

    fn trim_if_oversized(&self) -> Result<(), SinkError> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size <= self.max_bytes {
            return Ok(());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)?;
        let mut records = reader.records();
        let header = records.next().transpose()?;

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let tmp = File::create(&tmp_path).map_err(|source| self.io_error(source))?;
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(tmp);
        if let Some(header) = header {
            writer.write_record(&header)?;
        }
        for record in records.skip(TRIM_ROWS) {
            writer.write_record(&record?)?;
        }
        writer.flush().map_err(|source| self.io_error(source))?;
        drop(writer);

        fs::rename(&tmp_path, &self.path).map_err(|source| self.io_error(source))?;
        info!(
            "{} exceeded {} bytes, oldest {} rows removed",
            self.path.display(),
            self.max_bytes,
            TRIM_ROWS
        );
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl FieldSink for OfflineCsvSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&mut self, fields: &FieldMap) -> Result<(), SinkError> {
        self.append_at(fields, Local::now().naive_local())
    }
}

fn row(fields: &FieldMap, at: NaiveDateTime) -> Vec<String> {
    let mut row = Vec::with_capacity(CSV_COLUMNS.len());
    row.push(at.format(DATETIME_FORMAT).to_string());
    for column in &CSV_COLUMNS[1..] {
        let cell = match fields.get(column) {
            Some(FieldValue::Number(n)) if n.is_finite() => n.to_string(),
            Some(FieldValue::Text(text)) => text.clone(),
            _ => String::new(),
        };
        row.push(cell);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    #[test]
    fn row_follows_column_layout() {
        let mut fields = FieldMap::new();
        fields.insert("field3", 41.235);
        fields.insert("status", "ok");
        fields.insert("hive_name", "Linde");

        let row = row(&fields, noon());
        assert_eq!(row.len(), 13);
        assert_eq!(row[0], "2024-05-01 12:00:00");
        assert_eq!(row[3], "41.235");
        assert_eq!(row[12], "ok");
        assert!(row[1].is_empty());
    }

    #[test]
    fn header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = OfflineCsvSink::new(dir.path(), "42");
        let fields: FieldMap = [("field1", 21.5)].into_iter().collect();

        sink.append_at(&fields, noon()).unwrap();
        sink.append_at(&fields, noon()).unwrap();

        let contents = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("datetime,field1,field2"));
        assert_eq!(lines[1], "2024-05-01 12:00:00,21.5,,,,,,,,,,,");
        assert_eq!(sink.name(), "offline-42.csv");
    }
}
