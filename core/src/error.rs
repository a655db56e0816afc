use std::path::PathBuf;

use thiserror::Error;

use crate::budget::BudgetExceeded;

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("invalid workspace: {0}")]
    InvalidWorkspace(String),

    #[error("unknown package: {0}")]
    UnknownPackage(String),

    #[error("analysis of {} failed: {message}", .directory.display())]
    Analysis { directory: PathBuf, message: String },

    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    pub fn analysis(directory: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        KilnError::Analysis {
            directory: directory.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = KilnError> = std::result::Result<T, E>;
