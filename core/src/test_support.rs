use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::analyzer::{AnalyzerResult, CompileInputSet, ProjectAnalyzer};
use crate::backend::{Artifact, Backend, CompileOutput, ExecOutput};
use crate::budget::Budget;
use crate::error::{KilnError, Result};

/// Writes `project.toml` plus the given source files into `dir`.
pub fn write_project(dir: &Path, files: &[(&str, &str)]) {
    fs::write(dir.join("project.toml"), "[project]\nname = \"demo\"\n").unwrap();
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
}

/// Moves a file's modification time `ahead` into the future.
pub fn touch(path: &Path, ahead: Duration) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + ahead).unwrap();
}

#[derive(Debug, Clone)]
pub enum ExecBehavior {
    Print(Vec<String>),
    Hang,
    Crash(String),
}

/// A backend that analyzes real directories but only pretends to compile and
/// run, with scripted delays and failures.
pub struct FakeBackend {
    analyzer: ProjectAnalyzer,
    compile_delay: Duration,
    compile_failure: Mutex<Option<Vec<String>>>,
    exec: Mutex<ExecBehavior>,
    analyses: AtomicUsize,
    compiles: AtomicUsize,
    executions: AtomicUsize,
    compiled: Mutex<Vec<CompileInputSet>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            analyzer: ProjectAnalyzer::new("project.toml", vec!["sh".to_string()], "build"),
            compile_delay: Duration::ZERO,
            compile_failure: Mutex::new(None),
            exec: Mutex::new(ExecBehavior::Print(vec!["hello".to_string()])),
            analyses: AtomicUsize::new(0),
            compiles: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            compiled: Mutex::new(Vec::new()),
        }
    }

    pub fn with_compile_delay(mut self, delay: Duration) -> Self {
        self.compile_delay = delay;
        self
    }

    pub fn with_exec(self, behavior: ExecBehavior) -> Self {
        *self.exec.lock().unwrap() = behavior;
        self
    }

    pub fn fail_compiles(&self, diagnostics: Vec<String>) {
        *self.compile_failure.lock().unwrap() = Some(diagnostics);
    }

    pub fn analysis_count(&self) -> usize {
        self.analyses.load(Ordering::SeqCst)
    }

    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Input sets handed to `compile`, oldest first.
    pub fn compiled_inputs(&self) -> Vec<CompileInputSet> {
        self.compiled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn analyze(&self, directory: &Path) -> Result<AnalyzerResult> {
        self.analyses.fetch_add(1, Ordering::SeqCst);
        self.analyzer.analyze(directory)
    }

    async fn compile(
        &self,
        directory: &Path,
        inputs: &CompileInputSet,
        budget: &Budget,
    ) -> Result<CompileOutput> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.compiled.lock().unwrap().push(inputs.clone());
        budget.run(tokio::time::sleep(self.compile_delay)).await?;

        if let Some(diagnostics) = self.compile_failure.lock().unwrap().clone() {
            return Ok(CompileOutput::failed(diagnostics));
        }

        let artifact = Artifact {
            path: directory.join("build").join("app"),
            project_dir: directory.to_path_buf(),
        };
        fs::create_dir_all(directory.join("build"))?;
        fs::write(&artifact.path, "")?;

        Ok(CompileOutput {
            succeeded: true,
            artifact: Some(artifact),
            diagnostics: Vec::new(),
        })
    }

    async fn execute(&self, _artifact: &Artifact, budget: &Budget) -> Result<ExecOutput> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let behavior = self.exec.lock().unwrap().clone();

        match behavior {
            ExecBehavior::Print(output) => Ok(ExecOutput {
                output,
                ..ExecOutput::default()
            }),
            ExecBehavior::Hang => {
                budget.run(std::future::pending::<()>()).await?;
                unreachable!("pending future resolved")
            }
            ExecBehavior::Crash(message) => Err(KilnError::Other(anyhow::anyhow!(message))),
        }
    }
}
