//! Detail and summary logs
//!
//! The [`Reporter`] owns the two durable artifacts operators inspect after a
//! boot:
//!
//! - the detail log: timestamped free-text lines, each tagged with the step it
//!   belongs to so `grep '\[nvidia-driver\]'` yields one step's history
//! - the summary log: one `STATUS:step[:extra]` line per executed step, in
//!   execution order
//!
//! Both files are opened in append mode for every write so that an external
//! `tail -f` or a concurrent shell `>>` never sees truncated state. Every write
//! is mirrored as a tracing event.

use crate::errors::{BootstrapError, ReportError, Result};
use crate::redaction::Redactor;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Timestamp format of detail-log lines
const DETAIL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Status tag of a summary-log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SummaryTag {
    #[serde(rename = "STEP_OK")]
    Ok,
    #[serde(rename = "STEP_WARN")]
    Warn,
    #[serde(rename = "STEP_FAIL")]
    Fail,
    /// Informational line emitted by an action before its outcome
    #[serde(rename = "STEP_INFO")]
    Info,
}

impl SummaryTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryTag::Ok => "STEP_OK",
            SummaryTag::Warn => "STEP_WARN",
            SummaryTag::Fail => "STEP_FAIL",
            SummaryTag::Info => "STEP_INFO",
        }
    }
}

impl fmt::Display for SummaryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SummaryTag {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "STEP_OK" => Ok(SummaryTag::Ok),
            "STEP_WARN" => Ok(SummaryTag::Warn),
            "STEP_FAIL" => Ok(SummaryTag::Fail),
            "STEP_INFO" => Ok(SummaryTag::Info),
            _ => Err(()),
        }
    }
}

/// One summary-log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub tag: SummaryTag,
    pub step: String,
    pub extra: Option<String>,
}

impl SummaryEntry {
    pub fn new(tag: SummaryTag, step: impl Into<String>, extra: Option<String>) -> Self {
        Self {
            tag,
            step: step.into(),
            extra,
        }
    }

    /// Parse a `STATUS:step[:extra]` line. Anything after the second colon is
    /// the extra context, colons included.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim_end().splitn(3, ':');
        let tag = parts.next()?.parse().ok()?;
        let step = parts.next().filter(|s| !s.is_empty())?;
        let extra = parts.next().map(str::to_string);
        Some(Self::new(tag, step, extra))
    }
}

impl fmt::Display for SummaryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.step)?;
        if let Some(extra) = &self.extra {
            write!(f, ":{}", extra)?;
        }
        Ok(())
    }
}

/// Appends to the detail and summary logs
#[derive(Debug, Clone)]
pub struct Reporter {
    detail_path: PathBuf,
    summary_path: PathBuf,
    redactor: Redactor,
}

impl Reporter {
    pub fn new(
        detail_path: impl Into<PathBuf>,
        summary_path: impl Into<PathBuf>,
        redactor: Redactor,
    ) -> Self {
        Self {
            detail_path: detail_path.into(),
            summary_path: summary_path.into(),
            redactor,
        }
    }

    pub fn detail_path(&self) -> &Path {
        &self.detail_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    /// Redactor applied to every detail line
    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Append one timestamped line to the detail log. Multi-line messages are
    /// split so every physical line carries the timestamp and step tag.
    pub fn detail(&self, step: Option<&str>, message: &str) -> Result<()> {
        let message = self.redactor.redact(message);
        let timestamp = Utc::now().format(DETAIL_TIMESTAMP_FORMAT);
        let prefix = match step {
            Some(step) => format!("[{}] [{}]", timestamp, step),
            None => format!("[{}]", timestamp),
        };

        let mut block = String::new();
        for line in message.lines() {
            block.push_str(&prefix);
            block.push(' ');
            block.push_str(line);
            block.push('\n');
        }
        if block.is_empty() {
            block = format!("{}\n", prefix);
        }

        debug!(step = step.unwrap_or("-"), "{}", message);
        append(&self.detail_path, &block)
    }

    /// Append one line to the summary log
    pub fn summary(&self, entry: &SummaryEntry) -> Result<()> {
        let line = self.redactor.redact(&entry.to_string());
        match entry.tag {
            SummaryTag::Fail | SummaryTag::Warn => warn!(step = %entry.step, "{}", line),
            SummaryTag::Ok | SummaryTag::Info => info!(step = %entry.step, "{}", line),
        }
        append(&self.summary_path, &format!("{}\n", line))
    }

    /// Informational summary line (`STEP_INFO:step:message`) plus detail line
    pub fn info(&self, step: &str, message: &str) -> Result<()> {
        self.detail(Some(step), message)?;
        self.summary(&SummaryEntry::new(
            SummaryTag::Info,
            step,
            Some(message.to_string()),
        ))
    }

    /// Read back every parseable summary line; a missing file reads as empty
    pub fn read_summary(&self) -> Result<Vec<SummaryEntry>> {
        let content = match std::fs::read_to_string(&self.summary_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BootstrapError::Report(ReportError::Read {
                    path: self.summary_path.display().to_string(),
                    source,
                }))
            }
        };
        Ok(content.lines().filter_map(SummaryEntry::parse).collect())
    }
}

fn append(path: &Path, text: &str) -> Result<()> {
    let write_error = |source| {
        BootstrapError::Report(ReportError::Write {
            path: path.display().to_string(),
            source,
        })
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_error)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(write_error)?;
    file.write_all(text.as_bytes()).map_err(write_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reporter(tmp: &TempDir) -> Reporter {
        Reporter::new(
            tmp.path().join("logs/bootstrap.log"),
            tmp.path().join("logs/bootstrap.summary"),
            Redactor::new(),
        )
    }

    #[test]
    fn test_summary_entry_format_and_parse() {
        let entry = SummaryEntry::new(SummaryTag::Ok, "miniconda", None);
        assert_eq!(entry.to_string(), "STEP_OK:miniconda");

        let entry = SummaryEntry::new(
            SummaryTag::Fail,
            "nvidia-driver",
            Some("exit code 100: E: Unable to locate package".to_string()),
        );
        let line = entry.to_string();
        assert_eq!(SummaryEntry::parse(&line), Some(entry));

        assert_eq!(SummaryEntry::parse("garbage"), None);
        assert_eq!(SummaryEntry::parse("STEP_OK:"), None);
        assert_eq!(SummaryEntry::parse("STEP_DONE:x"), None);
    }

    #[test]
    fn test_summary_lines_are_appended_in_order() {
        let tmp = TempDir::new().unwrap();
        let reporter = reporter(&tmp);

        reporter
            .summary(&SummaryEntry::new(SummaryTag::Ok, "system-update", None))
            .unwrap();
        reporter
            .summary(&SummaryEntry::new(
                SummaryTag::Warn,
                "disable-nouveau",
                Some("exit code 1".to_string()),
            ))
            .unwrap();

        let content = std::fs::read_to_string(reporter.summary_path()).unwrap();
        assert_eq!(
            content,
            "STEP_OK:system-update\nSTEP_WARN:disable-nouveau:exit code 1\n"
        );

        let entries = reporter.read_summary().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].tag, SummaryTag::Warn);
    }

    #[test]
    fn test_detail_lines_are_tagged_and_redacted() {
        let tmp = TempDir::new().unwrap();
        let reporter = reporter(&tmp);
        reporter.redactor().add_secret("dcv123456789012");

        reporter
            .detail(Some("dcv-config"), "setting password dcv123456789012\nsecond line")
            .unwrap();
        reporter.detail(None, "run started").unwrap();

        let content = std::fs::read_to_string(reporter.detail_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("[dcv-config] setting password ****"));
        assert!(lines[1].ends_with("[dcv-config] second line"));
        assert!(lines[2].ends_with("UTC] run started"));
        assert!(!content.contains("dcv123456789012"));
    }

    #[test]
    fn test_info_writes_both_logs() {
        let tmp = TempDir::new().unwrap();
        let reporter = reporter(&tmp);
        reporter
            .info("efs-mount", "Configuring fstab and mounting")
            .unwrap();

        let summary = std::fs::read_to_string(reporter.summary_path()).unwrap();
        assert_eq!(summary, "STEP_INFO:efs-mount:Configuring fstab and mounting\n");
        let detail = std::fs::read_to_string(reporter.detail_path()).unwrap();
        assert!(detail.contains("[efs-mount] Configuring fstab"));
    }

    #[test]
    fn test_read_summary_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(reporter(&tmp).read_summary().unwrap().is_empty());
    }
}
