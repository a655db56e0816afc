use crate::parser::entry::{LogEntry, LogLevel};
use crate::parser::CompilerOutputParser;
use crate::pipeline::{OutcomeStatus, RunReport};
use std::io::Write;

pub struct Logger {
    use_colors: bool,
}

impl Logger {
    pub fn new() -> Self {
        Self {
            use_colors: atty::is(atty::Stream::Stdout),
        }
    }

    pub fn plain() -> Self {
        Self { use_colors: false }
    }

    pub fn log_entry(&self, entry: &LogEntry) {
        if self.use_colors {
            self.log_colored(entry);
        } else {
            self.log_plain(entry);
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.use_colors {
            println!("{}{}\x1b[0m", level_color(level), message);
        } else {
            println!("{}", message);
        }
    }

    /// Prints a run's program output, its diagnostics, then a status line.
    pub fn report(&self, report: &RunReport) {
        for line in report.outcome.output() {
            println!("{}", line);
        }

        let parser = CompilerOutputParser::new();
        for diagnostic in report.outcome.diagnostics() {
            let entry = parser.parse_line(diagnostic);
            self.log_entry(&entry);
        }

        let status = report.outcome.status();
        self.log(
            status_level(status),
            &format!(
                "{} {:?} in {:.2}s",
                report.package,
                status,
                report.elapsed.as_secs_f64()
            ),
        );
    }

    fn log_colored(&self, entry: &LogEntry) {
        let color = level_color(entry.level);
        let timestamp = entry.timestamp.format("%H:%M:%S");

        if let Some(location) = entry.location_string() {
            println!(
                "\x1b[90m[{}]\x1b[0m {}{}\x1b[0m \x1b[36m{}\x1b[0m",
                timestamp, color, entry.message, location
            );
        } else {
            println!("\x1b[90m[{}]\x1b[0m {}{}\x1b[0m", timestamp, color, entry.raw_line);
        }

        let _ = std::io::stdout().flush();
    }

    fn log_plain(&self, entry: &LogEntry) {
        let timestamp = entry.timestamp.format("%H:%M:%S");

        if let Some(location) = entry.location_string() {
            println!("[{}] {} ({})", timestamp, entry.message, location);
        } else {
            println!("[{}] {}", timestamp, entry.raw_line);
        }

        let _ = std::io::stdout().flush();
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

fn level_color(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "\x1b[90m",
        LogLevel::Info => "\x1b[37m",
        LogLevel::Warning => "\x1b[33m",
        LogLevel::Error => "\x1b[31m",
        LogLevel::Fatal => "\x1b[31;1m",
    }
}

pub fn status_level(status: OutcomeStatus) -> LogLevel {
    match status {
        OutcomeStatus::Success => LogLevel::Info,
        OutcomeStatus::UserCodeTimeout | OutcomeStatus::Faulted => LogLevel::Warning,
        OutcomeStatus::CompileFailure | OutcomeStatus::InvalidWorkspace => LogLevel::Error,
        OutcomeStatus::InfrastructureTimeout | OutcomeStatus::InternalError => LogLevel::Fatal,
    }
}
