//! The compilation backend seam.
//!
//! [`Backend`] is what the package and pipeline layers drive: analysis of an
//! on-disk project, compilation under a budget, and execution of the built
//! artifact under a budget. [`CommandBackend`] implements it with external
//! commands described by the configured [`Toolchain`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::analyzer::{AnalyzerResult, CompileInputSet, ProjectAnalyzer};
use crate::budget::Budget;
use crate::config::Config;
use crate::error::{KilnError, Result};
use crate::executor::{self, ExecutionResult};
use crate::parser::CompilerOutputParser;
use crate::toolchain::Toolchain;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub project_dir: PathBuf,
}

impl Artifact {
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub succeeded: bool,
    pub artifact: Option<Artifact>,
    pub diagnostics: Vec<String>,
}

impl CompileOutput {
    pub fn failed(diagnostics: Vec<String>) -> Self {
        Self {
            succeeded: false,
            artifact: None,
            diagnostics,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub output: Vec<String>,
    pub diagnostics: Vec<String>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.failure_reason.is_none()
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn analyze(&self, directory: &Path) -> Result<AnalyzerResult>;

    /// Compiles exactly `inputs`, the set a prior analysis of `directory`
    /// produced.
    async fn compile(
        &self,
        directory: &Path,
        inputs: &CompileInputSet,
        budget: &Budget,
    ) -> Result<CompileOutput>;

    /// Runs a built artifact. Returns [`KilnError::BudgetExceeded`] when the
    /// budget runs out while the program is still running.
    async fn execute(&self, artifact: &Artifact, budget: &Budget) -> Result<ExecOutput>;
}

pub type SharedBackend = Arc<dyn Backend>;

pub struct CommandBackend {
    analyzer: ProjectAnalyzer,
    toolchain: Toolchain,
}

impl CommandBackend {
    pub fn new(analyzer: ProjectAnalyzer, toolchain: Toolchain) -> Self {
        Self {
            analyzer,
            toolchain,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let analyzer = ProjectAnalyzer::new(
            config.packages.descriptor.clone(),
            config.toolchain.source_extensions.clone(),
            config.toolchain.artifact_dir.clone(),
        );
        Self::new(analyzer, Toolchain::from_config(&config.toolchain))
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }
}

#[async_trait]
impl Backend for CommandBackend {
    async fn analyze(&self, directory: &Path) -> Result<AnalyzerResult> {
        let analyzer = self.analyzer.clone();
        let directory = directory.to_path_buf();

        tokio::task::spawn_blocking(move || analyzer.analyze(&directory))
            .await
            .context("analysis task panicked")?
    }

    async fn compile(
        &self,
        directory: &Path,
        inputs: &CompileInputSet,
        budget: &Budget,
    ) -> Result<CompileOutput> {
        let artifact_dir = directory.join(self.toolchain.artifact_dir());
        tokio::fs::create_dir_all(&artifact_dir)
            .await
            .with_context(|| format!("Failed to create artifact directory: {}", artifact_dir.display()))?;

        let step = self.toolchain.compile_step(directory, inputs);
        budget.record_entry("compile.spawn");
        let result = executor::execute_step(&step, directory, budget).await?;

        let artifact = Artifact {
            path: self.toolchain.artifact_path(directory),
            project_dir: directory.to_path_buf(),
        };

        if !result.success {
            return Ok(CompileOutput::failed(compile_diagnostics(&result)));
        }

        if !artifact.exists() {
            return Ok(CompileOutput::failed(vec![format!(
                "compiler succeeded but produced no artifact at {}",
                artifact.path.display()
            )]));
        }

        let parser = CompilerOutputParser::new();
        Ok(CompileOutput {
            succeeded: true,
            artifact: Some(artifact),
            diagnostics: parser.diagnostics(result.stdout.iter().chain(&result.stderr)),
        })
    }

    async fn execute(&self, artifact: &Artifact, budget: &Budget) -> Result<ExecOutput> {
        if !artifact.exists() {
            return Err(KilnError::Other(anyhow::anyhow!(
                "artifact not found: {}",
                artifact.path.display()
            )));
        }

        let step = self.toolchain.run_step(artifact);
        let result = executor::execute_step(&step, &artifact.project_dir, budget).await?;

        let mut diagnostics = result.stderr;
        if let Some(reason) = &result.failure_reason {
            diagnostics.push(format!("Process failed: {}", reason));
        }

        Ok(ExecOutput {
            output: result.stdout,
            diagnostics,
            exit_code: result.exit_code,
            failure_reason: result.failure_reason,
        })
    }
}

fn compile_diagnostics(result: &ExecutionResult) -> Vec<String> {
    let parser = CompilerOutputParser::new();
    let mut diagnostics = parser.diagnostics(result.stdout.iter().chain(&result.stderr));

    if diagnostics.is_empty() {
        diagnostics.extend(result.stderr.iter().cloned());
    }

    diagnostics.push(format!(
        "compilation failed: {}",
        result
            .failure_reason
            .as_deref()
            .unwrap_or("unknown failure")
    ));
    diagnostics
}
