//! CSV export of a measurement log
//!
//! Writes `Date,Time,Weight (kg)` rows, one per measurement, in the order the
//! store holds them. Dates and times are rendered in a caller-chosen time zone.

use crate::error::{Result, ResultExt, ScaleError};
use crate::types::Measurement;
use chrono::{DateTime, Local, TimeZone};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// First line of every export
pub const CSV_HEADER: &str = "Date,Time,Weight (kg)";

/// Extension added to export paths that lack it
pub const CSV_EXTENSION: &str = "csv";

/// Write the header and one row per measurement
pub fn write_csv<W: Write, Tz: TimeZone>(
    writer: &mut W,
    records: &[Measurement],
    tz: &Tz,
) -> std::io::Result<()>
where
    Tz::Offset: std::fmt::Display,
{
    writeln!(writer, "{}", CSV_HEADER)?;
    for record in records {
        writeln!(
            writer,
            "{},{},{}",
            record.date_string(tz),
            record.time_string(tz),
            record.weight_string()
        )?;
    }
    Ok(())
}

/// Append `.csv` unless the path already ends with it (case-insensitive)
pub fn with_csv_extension(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let has_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(CSV_EXTENSION));
    if has_extension {
        path.to_path_buf()
    } else {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(CSV_EXTENSION);
        PathBuf::from(name)
    }
}

/// `weight_data_YYYYMMDD_HHMMSS.csv` for the given moment
pub fn default_file_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("weight_data_{}.{}", now.format("%Y%m%d_%H%M%S"), CSV_EXTENSION)
}

/// Export `records` to `path` in the given time zone; returns the path written
///
/// Fails with [`ScaleError::Export`] when there is nothing to export.
pub fn export_csv_in<Tz: TimeZone>(
    records: &[Measurement],
    path: impl AsRef<Path>,
    tz: &Tz,
) -> Result<PathBuf>
where
    Tz::Offset: std::fmt::Display,
{
    if records.is_empty() {
        return Err(ScaleError::Export("no data to export".to_string()));
    }

    let path = with_csv_extension(path);
    let file = File::create(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_csv(&mut writer, records, tz)
        .and_then(|_| writer.flush())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    tracing::info!("Exported {} records to {}", records.len(), path.display());
    Ok(path)
}

/// Export `records` to `path` in local time
pub fn export_csv(records: &[Measurement], path: impl AsRef<Path>) -> Result<PathBuf> {
    export_csv_in(records, path, &Local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn records() -> Vec<Measurement> {
        vec![
            Measurement::new(1_700_000_000_000, 72.346).unwrap(),
            Measurement::new(1_700_000_001_000, 0.5).unwrap(),
        ]
    }

    #[test]
    fn test_write_csv_utc() {
        let mut out = Vec::new();
        write_csv(&mut out, &records(), &Utc).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Date,Time,Weight (kg)\n2023-11-14,22:13:20,72.35\n2023-11-14,22:13:21,0.50\n"
        );
    }

    #[test]
    fn test_write_csv_empty_has_header() {
        let mut out = Vec::new();
        write_csv(&mut out, &[], &Utc).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Date,Time,Weight (kg)\n");
    }

    #[test]
    fn test_with_csv_extension() {
        assert_eq!(with_csv_extension("log"), PathBuf::from("log.csv"));
        assert_eq!(with_csv_extension("log.csv"), PathBuf::from("log.csv"));
        assert_eq!(with_csv_extension("log.CSV"), PathBuf::from("log.CSV"));
        assert_eq!(with_csv_extension("log.txt"), PathBuf::from("log.txt.csv"));
    }

    #[test]
    fn test_default_file_name() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(default_file_name(&now), "weight_data_20240309_070501.csv");
    }

    #[test]
    fn test_export_empty_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = export_csv(&[], dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ScaleError::Export(ref m) if m == "no data to export"));
        assert!(!dir.path().join("out.csv").exists());
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = export_csv_in(&records(), dir.path().join("missing").join("out"), &Utc);
        assert!(result.is_err());
    }
}
