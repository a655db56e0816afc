//! Runs a submitted workspace: validate, build if needed, execute, classify.
//!
//! The request budget is split into a `build` child (optionally bounded by
//! the build timeout) and an `execute` child bounded by the run timeout. A
//! budget running out anywhere before the `execute` child exists is an
//! infrastructure timeout; running out inside it is a user-code timeout.
//!
//! Script-mode runs build in a scratch package that lives only as long as the
//! run, so one request's buffers never reach another's build.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::analyzer::{ProjectDescriptor, ProjectSection};
use crate::backend::Artifact;
use crate::budget::{Budget, BudgetExceeded};
use crate::config::Config;
use crate::error::{KilnError, Result};
use crate::package::Package;
use crate::phase::{Phase, TimeoutKind};
use crate::registry::PackageRegistry;
use crate::workspace::{ValidatedWorkspace, Workspace, WorkspaceMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded {
        output: Vec<String>,
        diagnostics: Vec<String>,
    },
    CompileFailed {
        diagnostics: Vec<String>,
    },
    InfrastructureTimeout {
        diagnostics: Vec<String>,
    },
    UserCodeTimeout {
        diagnostics: Vec<String>,
    },
    Faulted {
        output: Vec<String>,
        diagnostics: Vec<String>,
    },
}

impl RunOutcome {
    pub fn status(&self) -> OutcomeStatus {
        match self {
            RunOutcome::Succeeded { .. } => OutcomeStatus::Success,
            RunOutcome::CompileFailed { .. } => OutcomeStatus::CompileFailure,
            RunOutcome::InfrastructureTimeout { .. } => OutcomeStatus::InfrastructureTimeout,
            RunOutcome::UserCodeTimeout { .. } => OutcomeStatus::UserCodeTimeout,
            RunOutcome::Faulted { .. } => OutcomeStatus::Faulted,
        }
    }

    pub fn output(&self) -> &[String] {
        match self {
            RunOutcome::Succeeded { output, .. } | RunOutcome::Faulted { output, .. } => output,
            _ => &[],
        }
    }

    pub fn diagnostics(&self) -> &[String] {
        match self {
            RunOutcome::Succeeded { diagnostics, .. }
            | RunOutcome::CompileFailed { diagnostics }
            | RunOutcome::InfrastructureTimeout { diagnostics }
            | RunOutcome::UserCodeTimeout { diagnostics }
            | RunOutcome::Faulted { diagnostics, .. } => diagnostics,
        }
    }

    fn terminal_phase(&self) -> Phase {
        match self {
            RunOutcome::Succeeded { .. } => Phase::Succeeded,
            RunOutcome::CompileFailed { .. } => Phase::CompileFailed,
            RunOutcome::InfrastructureTimeout { .. } => {
                Phase::TimedOut(TimeoutKind::Infrastructure)
            }
            RunOutcome::UserCodeTimeout { .. } => Phase::TimedOut(TimeoutKind::UserCode),
            RunOutcome::Faulted { .. } => Phase::Faulted,
        }
    }

    fn infrastructure_timeout(exceeded: BudgetExceeded) -> Self {
        RunOutcome::InfrastructureTimeout {
            diagnostics: vec![exceeded.to_string()],
        }
    }

    fn user_code_timeout(exceeded: BudgetExceeded) -> Self {
        RunOutcome::UserCodeTimeout {
            diagnostics: vec![exceeded.to_string()],
        }
    }
}

/// Boundary classification of a run, with its transport and CLI codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Faulted,
    CompileFailure,
    InvalidWorkspace,
    InfrastructureTimeout,
    UserCodeTimeout,
    InternalError,
}

impl OutcomeStatus {
    pub fn http_status(&self) -> u16 {
        match self {
            OutcomeStatus::Success | OutcomeStatus::Faulted => 200,
            OutcomeStatus::CompileFailure => 422,
            OutcomeStatus::InvalidWorkspace => 400,
            OutcomeStatus::InfrastructureTimeout => 504,
            OutcomeStatus::UserCodeTimeout => 417,
            OutcomeStatus::InternalError => 500,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            OutcomeStatus::Success => 0,
            OutcomeStatus::Faulted => 1,
            OutcomeStatus::CompileFailure => 2,
            OutcomeStatus::InfrastructureTimeout => 3,
            OutcomeStatus::UserCodeTimeout => 4,
            OutcomeStatus::InvalidWorkspace => 64,
            OutcomeStatus::InternalError => 70,
        }
    }

    /// Status for a run that ended in an error instead of an outcome.
    pub fn from_error(error: &KilnError) -> Self {
        match error {
            KilnError::InvalidWorkspace(_) | KilnError::UnknownPackage(_) => {
                OutcomeStatus::InvalidWorkspace
            }
            KilnError::Analysis { .. } => OutcomeStatus::CompileFailure,
            KilnError::BudgetExceeded(_) => OutcomeStatus::InfrastructureTimeout,
            KilnError::Io(_) | KilnError::Other(_) => OutcomeStatus::InternalError,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub build_timeout: Option<Duration>,
    pub run_timeout: Duration,
    pub script_package: String,
    /// Descriptor file name written into script-mode scratch packages.
    pub descriptor: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            build_timeout: config.budget.build_timeout(),
            run_timeout: config.budget.run_timeout(),
            script_package: config.packages.script_package.clone(),
            descriptor: config.packages.descriptor.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub package: String,
    pub outcome: RunOutcome,
    pub phases: Vec<Phase>,
    pub elapsed: Duration,
}

pub struct Pipeline {
    registry: Arc<PackageRegistry>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(registry: Arc<PackageRegistry>, options: PipelineOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<PackageRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub async fn run(&self, workspace: Workspace, budget: &Budget) -> Result<RunOutcome> {
        Ok(self.run_traced(workspace, budget).await?.outcome)
    }

    /// Like [`Pipeline::run`], also returning the phases the run went through.
    pub async fn run_traced(&self, workspace: Workspace, budget: &Budget) -> Result<RunReport> {
        let start = Instant::now();
        let mut trace = PhaseTrace::new();

        budget.record_entry("validate");
        let validated = match workspace.validate(&self.options.script_package) {
            Ok(validated) => validated,
            Err(e) => {
                trace.advance(Phase::Invalid);
                tracing::info!(error = %e, "rejected workspace");
                return Err(e);
            }
        };
        trace.advance(Phase::Validated);

        let (package, _scratch) = self.resolve(&validated).await?;
        let outcome = match self.build(&validated, &package, budget, &mut trace).await? {
            Ok(artifact) => self.execute(&package, &artifact, budget, &mut trace).await,
            Err(outcome) => outcome,
        };
        trace.advance(outcome.terminal_phase());

        let elapsed = start.elapsed();
        tracing::info!(
            package = %package.name(),
            status = ?outcome.status(),
            elapsed_ms = elapsed.as_millis() as u64,
            "run finished"
        );

        Ok(RunReport {
            package: package.name().to_string(),
            outcome,
            phases: trace.into_phases(),
            elapsed,
        })
    }

    /// The package a validated workspace builds in. Script runs get a fresh
    /// scratch directory, removed when the returned [`TempDir`] drops.
    async fn resolve(&self, workspace: &ValidatedWorkspace) -> Result<(Package, Option<TempDir>)> {
        match workspace.mode {
            WorkspaceMode::Project => Ok((self.registry.get(&workspace.package)?, None)),
            WorkspaceMode::Script => {
                let scratch = tempfile::Builder::new()
                    .prefix("kiln-script-")
                    .tempdir()
                    .context("Failed to create script directory")?;

                let descriptor = ProjectDescriptor {
                    project: ProjectSection {
                        name: workspace.package.clone(),
                        sources: None,
                    },
                };
                let descriptor = toml::to_string(&descriptor)
                    .context("Failed to serialize script descriptor")?;
                tokio::fs::write(scratch.path().join(&self.options.descriptor), descriptor).await?;

                tracing::debug!(directory = %scratch.path().display(), "created script package");
                let package = self.registry.ephemeral(&workspace.package, scratch.path());
                Ok((package, Some(scratch)))
            }
        }
    }

    /// Yields the artifact to run, or the outcome that ends the run early.
    async fn build(
        &self,
        workspace: &ValidatedWorkspace,
        package: &Package,
        budget: &Budget,
        trace: &mut PhaseTrace,
    ) -> Result<std::result::Result<Artifact, RunOutcome>> {
        let build_budget = budget.child("build", self.options.build_timeout);

        build_budget.record_entry("materialize");
        let materialized = match build_budget.run(workspace.materialize(package.directory())).await {
            Ok(materialized) => materialized,
            Err(e) => return Ok(Err(RunOutcome::infrastructure_timeout(e))),
        };
        materialized?;

        build_budget.record_entry("build");
        let result = match package.ensure_built(&build_budget).await {
            Ok(result) => result,
            Err(KilnError::BudgetExceeded(e)) => return Ok(Err(RunOutcome::infrastructure_timeout(e))),
            Err(e) => return Err(e),
        };

        if result.reused {
            trace.advance(Phase::CacheHit);
        } else {
            trace.advance(Phase::Building);
        }

        if !result.succeeded {
            return Ok(Err(RunOutcome::CompileFailed {
                diagnostics: result.diagnostics,
            }));
        }

        match result.artifact {
            Some(artifact) => {
                trace.advance(Phase::Built);
                Ok(Ok(artifact))
            }
            None => Ok(Err(RunOutcome::CompileFailed {
                diagnostics: vec!["build produced no artifact".to_string()],
            })),
        }
    }

    async fn execute(
        &self,
        package: &Package,
        artifact: &Artifact,
        budget: &Budget,
        trace: &mut PhaseTrace,
    ) -> RunOutcome {
        if let Err(e) = budget.check() {
            return RunOutcome::infrastructure_timeout(e);
        }

        let exec_budget = budget.child("execute", Some(self.options.run_timeout));
        trace.advance(Phase::Executing);
        exec_budget.record_entry("execute");

        let executed = match exec_budget
            .run(package.backend().execute(artifact, &exec_budget))
            .await
        {
            Ok(executed) => executed,
            Err(e) => return RunOutcome::user_code_timeout(e),
        };

        match executed {
            Ok(exec) if exec.succeeded() => RunOutcome::Succeeded {
                output: exec.output,
                diagnostics: exec.diagnostics,
            },
            Ok(exec) => {
                let mut diagnostics = exec.diagnostics;
                if diagnostics.is_empty() {
                    diagnostics.push(
                        exec.failure_reason
                            .unwrap_or_else(|| "program failed".to_string()),
                    );
                }
                RunOutcome::Faulted {
                    output: exec.output,
                    diagnostics,
                }
            }
            Err(KilnError::BudgetExceeded(e)) => RunOutcome::user_code_timeout(e),
            Err(e) => RunOutcome::Faulted {
                output: Vec::new(),
                diagnostics: vec![format!("{e:#}")],
            },
        }
    }
}

struct PhaseTrace {
    phases: Vec<Phase>,
}

impl PhaseTrace {
    fn new() -> Self {
        Self {
            phases: vec![Phase::Received],
        }
    }

    fn current(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Received)
    }

    fn advance(&mut self, next: Phase) {
        let current = self.current();
        if !current.can_advance_to(next) {
            tracing::warn!(from = %current, to = %next, "unexpected phase transition");
        }
        tracing::debug!(phase = %next, "{}", next.metadata().description);
        self.phases.push(next);
    }

    fn into_phases(self) -> Vec<Phase> {
        self.phases
    }
}
