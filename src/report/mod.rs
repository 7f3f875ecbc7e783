//! Summary of a backup run and its delivery by mail.

mod mail;

use std::fmt;

pub use mail::{MailSettings, ReportError, BACKUP_DATE_PLACEHOLDER, DEFAULT_SMTP_PORT};

/// Result of the backup of one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub name: String,
    pub description: String,
    /// File name of the dump, empty if no dump was attempted.
    pub file: String,
    pub success: bool,
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "Да" } else { "НЕТ" };
        write!(
            f,
            "{} ({}) Файл <{}> - {status}",
            self.name, self.description, self.file
        )
    }
}

/// Accumulates one [ReportLine] per processed database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    lines: Vec<ReportLine>,
}

impl Report {
    pub fn push(&mut self, line: ReportLine) {
        log::info!(target: "report", "{line}");
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[ReportLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.lines.iter().all(|line| line.success)
    }

    /// Text of the report, one line per database.
    pub fn body(&self) -> String {
        self.lines.iter().map(|line| format!("{line}\n")).collect()
    }
}
