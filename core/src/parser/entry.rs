use chrono::{DateTime, Local};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn to_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

/// Where in a source file a diagnostic points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
            if let Some(column) = self.column {
                write!(f, ":{}", column)?;
            }
        }
        Ok(())
    }
}

/// One line of tool output, classified.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
    pub raw_line: String,
    pub location: Option<SourceLocation>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: String, raw_line: String) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message,
            raw_line,
            location: None,
        }
    }

    pub fn at(mut self, file: String, line: Option<usize>, column: Option<usize>) -> Self {
        self.location = Some(SourceLocation { file, line, column });
        self
    }

    pub fn is_diagnostic(&self) -> bool {
        self.level >= LogLevel::Warning
    }

    /// `file:line:col: level: message` when located, otherwise the message.
    pub fn to_diagnostic(&self) -> String {
        match &self.location {
            Some(location) => format!(
                "{}: {}: {}",
                location,
                self.level.to_str().to_lowercase(),
                self.message
            ),
            None => self.message.clone(),
        }
    }

    pub fn location_string(&self) -> Option<String> {
        self.location.as_ref().map(ToString::to_string)
    }
}
