pub mod analyzer;
pub mod backend;
pub mod budget;
pub mod cache_policy;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod logger;
pub mod package;
pub mod parser;
pub mod phase;
pub mod pipeline;
pub mod registry;
pub mod toolchain;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use analyzer::{AnalyzerResult, CompileInputSet, ProjectAnalyzer};
pub use backend::{Artifact, Backend, CommandBackend, CompileOutput, ExecOutput, SharedBackend};
pub use budget::{Budget, BudgetEntry, BudgetExceeded, CancelReason};
pub use cache_policy::{BuildCachePolicy, BuildDecision, RebuildReason};
pub use cli::{Cli, Commands, HistoryCommands};
pub use config::Config;
pub use error::{KilnError, Result};
pub use executor::{execute_step, ExecutionResult};
pub use history::{RunHistory, RunHistoryEntry};
pub use package::{BuildResult, BuildState, Package};
pub use phase::{Phase, TimeoutKind};
pub use pipeline::{OutcomeStatus, Pipeline, PipelineOptions, RunOutcome, RunReport};
pub use registry::PackageRegistry;
pub use toolchain::{BuildStep, Toolchain};
pub use workspace::{Buffer, ValidatedWorkspace, Workspace, WorkspaceMode};
