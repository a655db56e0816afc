use super::entry::{LogEntry, LogLevel};
use once_cell::sync::Lazy;
use regex::Regex;

static LOCATED_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:\s][^:]*):(\d+):(\d+): (?:fatal )?error: (.+)$").unwrap());
static LOCATED_WARNING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:\s][^:]*):(\d+):(\d+): warning: (.+)$").unwrap());
static LOCATED_NOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:\s][^:]*):(\d+):(\d+): note: (.+)$").unwrap());
static LINE_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:\s][^:]*): line (\d+): (.+)$").unwrap());
static BARE_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:fatal )?error(?:\[\w+\])?: (.+)$").unwrap());
static BARE_WARNING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^warning(?:\[\w+\])?: (.+)$").unwrap());
static LINKER_ERROR_UNDEF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"undefined reference to").unwrap());
static LINKER_ERROR_MULTI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"multiple definition of").unwrap());

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

/// Classifies compiler and shell output lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompilerOutputParser;

impl CompilerOutputParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_line(&self, line: &str) -> LogEntry {
        let stripped = strip_ansi(line);

        let located = [
            (&*LOCATED_ERROR, LogLevel::Error),
            (&*LOCATED_WARNING, LogLevel::Warning),
            (&*LOCATED_NOTE, LogLevel::Debug),
        ];

        for (pattern, level) in located {
            if let Some(caps) = pattern.captures(&stripped) {
                return LogEntry::new(level, caps[4].to_string(), line.to_string()).at(
                    caps[1].to_string(),
                    caps[2].parse().ok(),
                    caps[3].parse().ok(),
                );
            }
        }

        if let Some(caps) = LINE_ERROR.captures(&stripped) {
            return LogEntry::new(LogLevel::Error, caps[3].to_string(), line.to_string())
                .at(caps[1].to_string(), caps[2].parse().ok(), None);
        }

        if let Some(caps) = BARE_ERROR.captures(&stripped) {
            return LogEntry::new(LogLevel::Error, caps[1].to_string(), line.to_string());
        }

        if let Some(caps) = BARE_WARNING.captures(&stripped) {
            return LogEntry::new(LogLevel::Warning, caps[1].to_string(), line.to_string());
        }

        if LINKER_ERROR_UNDEF.is_match(&stripped) || LINKER_ERROR_MULTI.is_match(&stripped) {
            return LogEntry::new(LogLevel::Error, stripped.clone(), line.to_string());
        }

        LogEntry::new(LogLevel::Info, stripped, line.to_string())
    }

    /// Parses every line and keeps the warnings and errors as diagnostics.
    pub fn diagnostics<'a, I>(&self, lines: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        lines
            .into_iter()
            .map(|line| self.parse_line(line))
            .filter(LogEntry::is_diagnostic)
            .map(|entry| entry.to_diagnostic())
            .collect()
    }
}

fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcc_error_parsing() {
        let parser = CompilerOutputParser::new();
        let line = "src/main.c:42:10: error: 'foo' undeclared (first use in this function)";
        let entry = parser.parse_line(line);

        assert_eq!(entry.level, LogLevel::Error);
        let location = entry.location.clone().unwrap();
        assert_eq!(location.file, "src/main.c");
        assert_eq!(location.line, Some(42));
        assert_eq!(location.column, Some(10));
        assert_eq!(
            entry.to_diagnostic(),
            "src/main.c:42:10: error: 'foo' undeclared (first use in this function)"
        );
    }

    #[test]
    fn test_shell_line_error_parsing() {
        let parser = CompilerOutputParser::new();
        let entry = parser.parse_line("/p/build/app: line 3: nope: command not found");

        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.location_string().as_deref(), Some("/p/build/app:3"));
        assert_eq!(entry.message, "nope: command not found");
    }

    #[test]
    fn test_bare_error_with_code() {
        let parser = CompilerOutputParser::new();
        let entry = parser.parse_line("error[E0425]: cannot find value `x` in this scope");

        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "cannot find value `x` in this scope");
        assert!(entry.location.is_none());
    }

    #[test]
    fn test_diagnostics_keep_only_warnings_and_errors() {
        let parser = CompilerOutputParser::new();
        let lines = vec![
            "compiling...".to_string(),
            "a.c:1:1: warning: unused variable 'x'".to_string(),
            "a.c:2:1: note: declared here".to_string(),
            "a.c:3:5: error: expected ';'".to_string(),
        ];

        let diagnostics = parser.diagnostics(&lines);
        assert_eq!(
            diagnostics,
            vec![
                "a.c:1:1: warning: unused variable 'x'",
                "a.c:3:5: error: expected ';'",
            ]
        );
    }

    #[test]
    fn test_ansi_stripping() {
        let ansi_str = "\x1b[31mError:\x1b[0m Something went wrong";
        let stripped = strip_ansi(ansi_str);
        assert_eq!(stripped, "Error: Something went wrong");
    }
}
