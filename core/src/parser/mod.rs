pub mod entry;
pub mod parser;

pub use entry::{LogEntry, LogLevel, SourceLocation};
pub use parser::CompilerOutputParser;
