//! Domain list input and CSV report output.

use crate::base::context::IoResultExt;
use crate::base::error::AuditError;
use crate::runner::ComplianceResult;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// Expiry column format, e.g. `Mon, 02 Jan 2006 15:04:05 GMT`.
const RFC1123: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub const REPORT_HEADERS: [&str; 13] = [
    "Website",
    "Domain",
    "Name",
    "Value",
    "Path",
    "Expires",
    "IsExpired",
    "Generated Consent String",
    "API Consent String",
    "StringsEqual",
    "EventStatus b4",
    "EventStatus after",
    "Status Updated",
];

/// Where result rows go.
pub trait ResultSink: Send {
    /// Write one row and make it durable before returning.
    fn write_result(&mut self, row: &ComplianceResult) -> Result<(), AuditError>;
}

/// Read the first column of every record, without a header row.
pub fn read_domains(path: &Path) -> Result<Vec<String>, AuditError> {
    let file = File::open(path).file_context(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut domains = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| AuditError::DomainList {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        match record.get(0).map(str::trim) {
            Some(domain) if !domain.is_empty() => domains.push(domain.to_string()),
            _ => {}
        }
    }
    Ok(domains)
}

/// Append-only CSV report, flushed after every row.
pub struct CsvReport {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvReport {
    /// Open `path` for appending. The header row is written only when the
    /// file is empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .file_context(&path)?;
        let is_empty = file.metadata().file_context(&path)?.len() == 0;

        let mut report = Self {
            writer: csv::WriterBuilder::new().has_headers(false).from_writer(file),
            path,
        };
        if is_empty {
            report.write_record(REPORT_HEADERS.iter().map(|h| h.to_string()))?;
        }
        Ok(report)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record<I>(&mut self, fields: I) -> Result<(), AuditError>
    where
        I: IntoIterator<Item = String>,
    {
        self.writer
            .write_record(fields)
            .map_err(|e| AuditError::report(&self.path, e))?;
        self.writer
            .flush()
            .map_err(|e| AuditError::report(&self.path, e))
    }
}

impl ResultSink for CsvReport {
    fn write_result(&mut self, row: &ComplianceResult) -> Result<(), AuditError> {
        self.write_record(result_fields(row))
    }
}

impl std::fmt::Debug for CsvReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvReport").field("path", &self.path).finish()
    }
}

/// Rows kept in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub rows: Vec<ComplianceResult>,
}

impl ResultSink for MemorySink {
    fn write_result(&mut self, row: &ComplianceResult) -> Result<(), AuditError> {
        self.rows.push(row.clone());
        Ok(())
    }
}

impl<T: ResultSink + ?Sized> ResultSink for &mut T {
    fn write_result(&mut self, row: &ComplianceResult) -> Result<(), AuditError> {
        (**self).write_result(row)
    }
}

/// Format an expiry for the report; a missing one renders as the zero time.
pub fn format_expiry(expires: Option<OffsetDateTime>) -> String {
    let when = expires.unwrap_or(OffsetDateTime::UNIX_EPOCH);
    when.to_offset(time::UtcOffset::UTC)
        .format(RFC1123)
        .unwrap_or_default()
}

fn result_fields(row: &ComplianceResult) -> [String; 13] {
    [
        row.website.clone(),
        row.cookie_domain.clone(),
        row.name.clone(),
        row.value.clone(),
        row.path.clone(),
        format_expiry(row.expires),
        row.is_expired.to_string(),
        row.injected.clone(),
        row.reported.clone(),
        row.strings_agree.to_string(),
        row.event_status_before.clone(),
        row.event_status_after.clone(),
        row.status_changed.to_string(),
    ]
}
