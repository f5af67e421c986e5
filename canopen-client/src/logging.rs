// logging.rs - operator report lines and the CSV transfer log
use chrono::Local;
use csv::Writer;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Log file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Whether operations report what they did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    /// Only the result value is returned
    #[default]
    Silent,
    /// Every operation also produces a report line
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Block,
    Nmt,
    Pdo,
    Can,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Block => "Block",
            Self::Nmt => "NMT",
            Self::Pdo => "PDO",
            Self::Can => "CAN",
        };
        f.pad(label)
    }
}

/// Object dictionary lookup used for report text only
pub trait ObjectDescriptions: Send + Sync {
    fn describe(&self, index: u16, subindex: u8) -> Option<String>;
}

impl ObjectDescriptions for HashMap<(u16, u8), String> {
    fn describe(&self, index: u16, subindex: u8) -> Option<String> {
        self.get(&(index, subindex)).cloned()
    }
}

const COMMENT_WIDTH: usize = 33;

/// One line of the operator report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub operation: Operation,
    pub node: Option<u8>,
    /// `index:subindex` for SDO, the CAN-ID for PDO/CAN
    pub address: Option<String>,
    pub size: Option<usize>,
    pub success: bool,
    /// Object description or caller comment
    pub comment: Option<String>,
    pub message: String,
}

impl ReportLine {
    pub fn new(operation: Operation, success: bool, message: impl Into<String>) -> Self {
        Self {
            operation,
            node: None,
            address: None,
            size: None,
            success,
            comment: None,
            message: message.into(),
        }
    }

    pub fn node(mut self, node: u8) -> Self {
        self.node = Some(node);
        self
    }

    pub fn object(mut self, index: u16, subindex: u8) -> Self {
        self.address = Some(format!("0x{:04X}:{:02X}", index, subindex));
        self
    }

    pub fn can_id(mut self, can_id: u32) -> Self {
        self.address = Some(format!("0x{:03X}", can_id));
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }

    pub fn status(&self) -> &'static str {
        if self.success {
            "SUCC"
        } else {
            "FAIL"
        }
    }
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node.map_or_else(|| "-".to_string(), |node| format!("0x{:02X}", node));
        let size = self.size.map_or_else(|| "-".to_string(), |size| size.to_string());
        let comment: String = self.comment.as_deref().unwrap_or("-").chars().take(COMMENT_WIDTH).collect();

        write!(
            f,
            "{:<5} {:<6} {:<12} {:<6} {:<4} {:<width$} {}",
            self.operation,
            node,
            self.address.as_deref().unwrap_or("-"),
            size,
            self.status(),
            comment,
            self.message,
            width = COMMENT_WIDTH
        )
    }
}

/// CSV log of report lines, disabled until [`TransferLog::enable`]
#[derive(Default)]
pub struct TransferLog {
    writer: Mutex<Option<Writer<File>>>,
    log_file_path: Mutex<Option<PathBuf>>,
}

impl TransferLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable logging and create a new log file. Returns its path.
    pub fn enable(&self, log_directory: &Path) -> Result<PathBuf, LogError> {
        fs::create_dir_all(log_directory)?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let log_path = log_directory.join(format!("canopen_log_{}.csv", timestamp));

        let mut writer = Writer::from_writer(File::create(&log_path)?);
        writer.write_record(["Timestamp", "Operation", "Node", "Address", "Size", "Status", "Message"])?;
        writer.flush()?;

        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);
        *self.log_file_path.lock().unwrap_or_else(PoisonError::into_inner) = Some(log_path.clone());

        info!("Logging enabled: {:?}", log_path);
        Ok(log_path)
    }

    /// Disable logging and close the file
    pub fn disable(&self) {
        if self.writer.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            info!("Logging disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Path of the most recently opened log file
    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.log_file_path.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn log(&self, line: &ReportLine) {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = guard.as_mut() else {
            return;
        };

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let operation = line.operation.to_string();
        let node = line.node.map(|node| format!("0x{:02X}", node)).unwrap_or_default();
        let size = line.size.map(|size| size.to_string()).unwrap_or_default();

        let record: [&str; 7] = [
            &timestamp,
            &operation,
            &node,
            line.address.as_deref().unwrap_or(""),
            &size,
            line.status(),
            &line.message,
        ];
        if let Err(e) = writer.write_record(record) {
            warn!("Failed to write log entry: {}", e);
        }
        if let Err(e) = writer.flush() {
            warn!("Failed to flush log file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_line_layout() {
        let line = ReportLine::new(Operation::Read, true, "4 byte(s): 0x44434241 ABCD")
            .node(0x20)
            .object(0x1008, 0)
            .size(4)
            .comment(Some("Manufacturer device name".to_string()));

        let text = line.to_string();
        assert!(text.starts_with("Read  0x20   0x1008:00    4      SUCC Manufacturer device name"));
        assert!(text.ends_with("4 byte(s): 0x44434241 ABCD"));

        let failed = ReportLine::new(Operation::Pdo, false, "Invalid TPDO CAN-ID").can_id(0x180);
        assert_eq!(failed.status(), "FAIL");
        assert!(failed.to_string().starts_with("PDO   -      0x180        -      FAIL -"));
    }

    #[test]
    fn long_comments_are_cut() {
        let line = ReportLine::new(Operation::Write, true, "ok").comment(Some("x".repeat(50)));
        assert!(line.to_string().contains(&format!("{} ok", "x".repeat(COMMENT_WIDTH))));
    }

    #[test]
    fn descriptions_from_a_map() {
        let mut names = HashMap::new();
        names.insert((0x1008, 0), "Manufacturer device name".to_string());
        assert_eq!(names.describe(0x1008, 0).as_deref(), Some("Manufacturer device name"));
        assert_eq!(names.describe(0x1009, 0), None);
    }

    #[test]
    fn writes_csv_records_while_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransferLog::new();
        let line = ReportLine::new(Operation::Nmt, true, "Start (go to Operational)").node(5);

        log.log(&line);
        assert!(!log.is_enabled());

        let path = log.enable(dir.path()).unwrap();
        assert!(log.is_enabled());
        log.log(&line);
        log.log(&ReportLine::new(Operation::Read, false, "SDO timeout").node(0x20).object(0x1000, 0));
        log.disable();
        log.log(&line);
        assert_eq!(log.log_file_path(), Some(path.clone()));

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(
            reader.headers().unwrap().iter().collect::<Vec<_>>(),
            vec!["Timestamp", "Operation", "Node", "Address", "Size", "Status", "Message"]
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "NMT");
        assert_eq!(&rows[0][2], "0x05");
        assert_eq!(&rows[0][5], "SUCC");
        assert_eq!(&rows[1][3], "0x1000:00");
        assert_eq!(&rows[1][5], "FAIL");
        assert_eq!(&rows[1][6], "SDO timeout");
    }
}
