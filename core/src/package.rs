//! An on-disk project and the state of its last successful build.
//!
//! [`Package::ensure_built`] is the only way a package's build state changes.
//! Concurrent callers on the same package share one in-flight build: the
//! first caller claims the build under a short-lived lock and spawns it, and
//! everyone else awaits the same shared future.
//!
//! The spawned build runs under a budget owned by the package, bounded only by
//! the package's build timeout. A caller's budget limits how long that caller
//! waits, never the build other callers are sharing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::analyzer::AnalyzerResult;
use crate::backend::{Artifact, SharedBackend};
use crate::budget::{Budget, BudgetExceeded};
use crate::cache_policy::{BuildCachePolicy, BuildDecision, RebuildReason};
use crate::error::{KilnError, Result};

#[derive(Debug, Clone, Default)]
pub struct BuildState {
    pub last_analyzer_result: Option<AnalyzerResult>,
    pub last_successful_build_time_utc: Option<DateTime<Utc>>,
    pub artifact: Option<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub succeeded: bool,
    pub diagnostics: Vec<String>,
    /// True when the previous build was reused without compiling.
    pub reused: bool,
    pub artifact: Option<Artifact>,
}

impl BuildResult {
    pub fn failed(diagnostics: Vec<String>) -> Self {
        Self {
            succeeded: false,
            diagnostics,
            reused: false,
            artifact: None,
        }
    }

    fn reused(artifact: Option<Artifact>) -> Self {
        Self {
            succeeded: true,
            diagnostics: Vec::new(),
            reused: true,
            artifact,
        }
    }
}

type SharedBuild = Shared<BoxFuture<'static, Result<BuildResult, BudgetExceeded>>>;

struct PackageInner {
    name: String,
    directory: PathBuf,
    backend: SharedBackend,
    policy: BuildCachePolicy,
    state: Mutex<BuildState>,
    in_flight: Mutex<Option<SharedBuild>>,
    build_timeout: Option<Duration>,
    compiles: AtomicUsize,
}

#[derive(Clone)]
pub struct Package {
    inner: Arc<PackageInner>,
}

impl Package {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, backend: SharedBackend) -> Self {
        Self::with_build_timeout(name, directory, backend, None)
    }

    /// A package whose shared builds give up after `build_timeout`.
    pub fn with_build_timeout(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        backend: SharedBackend,
        build_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(PackageInner {
                name: name.into(),
                directory: directory.into(),
                backend,
                policy: BuildCachePolicy::new(),
                state: Mutex::new(BuildState::default()),
                in_flight: Mutex::new(None),
                build_timeout,
                compiles: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.inner.backend
    }

    pub fn state(&self) -> BuildState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn last_successful_build_time_utc(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().unwrap().last_successful_build_time_utc
    }

    pub fn last_analyzer_result(&self) -> Option<AnalyzerResult> {
        self.inner.state.lock().unwrap().last_analyzer_result.clone()
    }

    /// Number of times this package has invoked the compiler.
    pub fn compile_count(&self) -> usize {
        self.inner.compiles.load(Ordering::SeqCst)
    }

    /// Forgets the last successful build so the next `ensure_built` compiles.
    pub fn invalidate(&self) {
        *self.inner.state.lock().unwrap() = BuildState::default();
    }

    pub async fn rebuild_reason(&self, budget: &Budget) -> Result<Option<RebuildReason>> {
        let state = self.state();
        let decision = self
            .inner
            .policy
            .evaluate(&self.inner.directory, &state, self.inner.backend.as_ref(), budget)
            .await?;
        Ok(decision.reason().cloned())
    }

    pub async fn should_build(&self, budget: &Budget) -> Result<bool> {
        Ok(self.rebuild_reason(budget).await?.is_some())
    }

    pub async fn ensure_built(&self, budget: &Budget) -> Result<BuildResult> {
        budget.check()?;

        let build = self.claim_build(budget);
        let result = budget.run(build).await??;
        Ok(result)
    }

    fn claim_build(&self, budget: &Budget) -> SharedBuild {
        let mut in_flight = self.inner.in_flight.lock().unwrap();

        if let Some(build) = in_flight.as_ref() {
            tracing::debug!(package = %self.inner.name, "joining in-flight build");
            budget.record_entry("build.join");
            return build.clone();
        }

        budget.record_entry("build.claim");
        let inner = Arc::clone(&self.inner);
        let budget = Budget::new(format!("{}.build", inner.name), inner.build_timeout);
        let handle = tokio::spawn(async move {
            let _release = ReleaseInFlight(Arc::clone(&inner));
            inner.build(&budget).await
        });

        let build = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Ok(BuildResult::failed(vec![format!("build task failed: {e}")])),
            }
        }
        .boxed()
        .shared();

        *in_flight = Some(build.clone());
        build
    }
}

/// Clears the in-flight slot when the build task ends, including by panic.
struct ReleaseInFlight(Arc<PackageInner>);

impl Drop for ReleaseInFlight {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.0.in_flight.lock() {
            in_flight.take();
        }
    }
}

impl PackageInner {
    async fn build(&self, budget: &Budget) -> Result<BuildResult, BudgetExceeded> {
        budget.record_entry("analyze");
        budget.check()?;

        let state = self.state.lock().unwrap().clone();
        let decision = match self
            .policy
            .evaluate(&self.directory, &state, self.backend.as_ref(), budget)
            .await
        {
            Ok(decision) => decision,
            Err(KilnError::BudgetExceeded(e)) => return Err(e),
            Err(e) => {
                tracing::warn!(package = %self.name, error = %e, "staleness check failed");
                return Ok(BuildResult::failed(vec![e.to_string()]));
            }
        };

        let (reason, analysis) = match decision {
            BuildDecision::Fresh => {
                tracing::debug!(package = %self.name, "reusing previous build");
                return Ok(BuildResult::reused(state.artifact));
            }
            BuildDecision::Rebuild { reason, analysis } => (reason, analysis),
        };

        tracing::info!(package = %self.name, %reason, "building");

        let analysis = match analysis {
            Some(analysis) => analysis,
            None => match budget.run(self.backend.analyze(&self.directory)).await? {
                Ok(analysis) => analysis,
                Err(e) => return Ok(BuildResult::failed(vec![e.to_string()])),
            },
        };

        if !analysis.succeeded {
            return Ok(BuildResult::failed(analysis.diagnostics));
        }

        budget.record_entry("compile");
        budget.check()?;

        self.compiles.fetch_add(1, Ordering::SeqCst);
        let output = match self
            .backend
            .compile(&self.directory, &analysis.compile_inputs, budget)
            .await
        {
            Ok(output) => output,
            Err(KilnError::BudgetExceeded(e)) => return Err(e),
            Err(e) => return Ok(BuildResult::failed(vec![format!("{e:#}")])),
        };

        if !output.succeeded {
            tracing::info!(package = %self.name, "build failed");
            return Ok(BuildResult::failed(output.diagnostics));
        }

        let completed = Utc::now();
        {
            let mut state = self.state.lock().unwrap();
            *state = BuildState {
                last_analyzer_result: Some(analysis),
                last_successful_build_time_utc: Some(completed),
                artifact: output.artifact.clone(),
            };
        }

        tracing::info!(package = %self.name, at = %completed, "build succeeded");

        Ok(BuildResult {
            succeeded: true,
            diagnostics: output.diagnostics,
            reused: false,
            artifact: output.artifact,
        })
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("name", &self.inner.name)
            .field("directory", &self.inner.directory)
            .field("state", &self.state())
            .finish()
    }
}
