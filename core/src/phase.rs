use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Ran out of time before user code started.
    Infrastructure,
    /// Ran out of time while user code was running.
    UserCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Received,
    Validated,
    Invalid,
    Building,
    CacheHit,
    Built,
    CompileFailed,
    Executing,
    Succeeded,
    Faulted,
    TimedOut(TimeoutKind),
}

#[derive(Debug, Clone)]
pub struct PhaseMetadata {
    pub description: String,
    pub is_terminal: bool,
}

impl Phase {
    pub fn metadata(&self) -> PhaseMetadata {
        let (description, is_terminal) = match self {
            Phase::Received => ("Workspace received", false),
            Phase::Validated => ("Workspace validated", false),
            Phase::Invalid => ("Workspace rejected", true),
            Phase::Building => ("Building package", false),
            Phase::CacheHit => ("Reusing previous build", false),
            Phase::Built => ("Artifact ready", false),
            Phase::CompileFailed => ("Compilation failed", true),
            Phase::Executing => ("Executing program", false),
            Phase::Succeeded => ("Program finished", true),
            Phase::Faulted => ("Program faulted", true),
            Phase::TimedOut(TimeoutKind::Infrastructure) => ("Timed out before execution", true),
            Phase::TimedOut(TimeoutKind::UserCode) => ("Timed out during execution", true),
        };

        PhaseMetadata {
            description: description.to_string(),
            is_terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.metadata().is_terminal
    }

    /// Whether the pipeline may move from `self` straight to `next`.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        use Phase::*;

        match (self, next) {
            (Received, Validated | Invalid | TimedOut(TimeoutKind::Infrastructure)) => true,
            (Validated, Building | CacheHit | TimedOut(TimeoutKind::Infrastructure)) => true,
            (Building, Built | CompileFailed | TimedOut(TimeoutKind::Infrastructure)) => true,
            (CacheHit, Built) => true,
            (Built, Executing | TimedOut(TimeoutKind::Infrastructure)) => true,
            (Executing, Succeeded | Faulted | TimedOut(TimeoutKind::UserCode)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Received => "Received",
            Phase::Validated => "Validated",
            Phase::Invalid => "Invalid",
            Phase::Building => "Building",
            Phase::CacheHit => "CacheHit",
            Phase::Built => "Built",
            Phase::CompileFailed => "CompileFailed",
            Phase::Executing => "Executing",
            Phase::Succeeded => "Succeeded",
            Phase::Faulted => "Faulted",
            Phase::TimedOut(TimeoutKind::Infrastructure) => "TimedOut(Infrastructure)",
            Phase::TimedOut(TimeoutKind::UserCode) => "TimedOut(UserCode)",
        };
        write!(f, "{}", name)
    }
}
