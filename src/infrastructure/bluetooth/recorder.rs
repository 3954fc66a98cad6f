//! CSV log of accepted notifications
//!
//! ```text
//! timestamp,characteristic,hex_data,length
//! 2024-05-01T10:00:00.123Z,2AD2,44 00 90 03 98 00 64 00,8
//! ```

use super::protocol::{format_hex, uuids};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

pub const CSV_HEADER: &str = "timestamp,characteristic,hex_data,length";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSummary {
    pub path: PathBuf,
    pub records: u64,
}

pub struct CsvRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl CsvRecorder {
    /// Create (or truncate) `path` and write the header row
    pub fn start(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{}", CSV_HEADER)?;
        writer.flush()?;
        info!("Recording notifications to {}", path.display());
        Ok(Self {
            path,
            writer,
            records: 0,
        })
    }

    pub fn append(&mut self, characteristic: &Uuid, data: &[u8]) -> std::io::Result<()> {
        self.append_at(Utc::now(), characteristic, data)
    }

    pub fn append_at(
        &mut self,
        timestamp: DateTime<Utc>,
        characteristic: &Uuid,
        data: &[u8],
    ) -> std::io::Result<()> {
        writeln!(self.writer, "{}", format_record(timestamp, characteristic, data))?;
        self.writer.flush()?;
        self.records += 1;
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<LogSummary> {
        self.writer.flush()?;
        info!(
            "Stopped recording: {} records in {}",
            self.records,
            self.path.display()
        );
        Ok(LogSummary {
            path: self.path,
            records: self.records,
        })
    }
}

pub fn format_record(timestamp: DateTime<Utc>, characteristic: &Uuid, data: &[u8]) -> String {
    format!(
        "{},{},{},{}",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        uuids::display_uuid(characteristic),
        format_hex(data),
        data.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_record() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let line = format_record(
            ts,
            &uuids::INDOOR_BIKE_DATA,
            &[0x44, 0x00, 0x90, 0x03, 0x98, 0x00, 0x64, 0x00],
        );
        assert_eq!(
            line,
            "2024-05-01T10:00:00.000Z,2AD2,44 00 90 03 98 00 64 00,8"
        );
    }

    #[test]
    fn test_recorder_writes_header_and_rows() {
        let path = std::env::temp_dir()
            .join(format!("ble_fitness_bridge_recorder_{}.csv", std::process::id()));
        let mut recorder = CsvRecorder::start(&path).unwrap();
        recorder
            .append(&uuids::HEART_RATE_MEASUREMENT, &[0x00, 0x48])
            .unwrap();
        recorder.append(&uuids::HEART_RATE_MEASUREMENT, &[]).unwrap();
        let summary = recorder.finish().unwrap();
        assert_eq!(summary.records, 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].ends_with(",2A37,00 48,2"));
        assert!(lines[2].ends_with(",2A37,,0"));
        let _ = std::fs::remove_file(&path);
    }
}
