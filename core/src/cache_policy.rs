//! Decides whether a package's previous build can be reused.
//!
//! Timestamps are compared against the time the last build completed and are
//! inherently racy against concurrent writers; a missed change only costs a
//! cache hit that should have been a miss until the next edit.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::analyzer::{last_write_time, AnalyzerResult};
use crate::backend::Backend;
use crate::budget::Budget;
use crate::error::{KilnError, Result};
use crate::package::BuildState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    NeverBuilt,
    ArtifactMissing,
    DescriptorModified,
    InputSetChanged,
    InputModified(PathBuf),
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::NeverBuilt => write!(f, "never built"),
            RebuildReason::ArtifactMissing => write!(f, "build artifact missing"),
            RebuildReason::DescriptorModified => write!(f, "project descriptor modified"),
            RebuildReason::InputSetChanged => write!(f, "compile inputs changed"),
            RebuildReason::InputModified(path) => write!(f, "{} modified", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BuildDecision {
    Fresh,
    Rebuild {
        reason: RebuildReason,
        /// The analysis computed while deciding, handed on so the build does
        /// not analyze the project a second time.
        analysis: Option<AnalyzerResult>,
    },
}

impl BuildDecision {
    pub fn should_build(&self) -> bool {
        matches!(self, BuildDecision::Rebuild { .. })
    }

    pub fn reason(&self) -> Option<&RebuildReason> {
        match self {
            BuildDecision::Fresh => None,
            BuildDecision::Rebuild { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildCachePolicy;

impl BuildCachePolicy {
    pub fn new() -> Self {
        Self
    }

    /// Structural reasons to rebuild that need no analysis.
    pub fn base_reason(&self, state: &BuildState) -> Option<RebuildReason> {
        if state.last_successful_build_time_utc.is_none() {
            return Some(RebuildReason::NeverBuilt);
        }

        match &state.artifact {
            Some(artifact) if artifact.exists() => None,
            _ => Some(RebuildReason::ArtifactMissing),
        }
    }

    /// Compares a fresh analysis with the state of the last successful build.
    pub fn compare(&self, state: &BuildState, fresh: &AnalyzerResult) -> Result<Option<RebuildReason>> {
        let Some(built_at) = state.last_successful_build_time_utc else {
            return Ok(Some(RebuildReason::NeverBuilt));
        };

        if last_write_time(&fresh.project_descriptor_path)? > built_at {
            return Ok(Some(RebuildReason::DescriptorModified));
        }

        let unchanged = state
            .last_analyzer_result
            .as_ref()
            .is_some_and(|cached| cached.compile_inputs == fresh.compile_inputs);
        if !unchanged {
            return Ok(Some(RebuildReason::InputSetChanged));
        }

        for path in fresh.compile_inputs.iter() {
            if last_write_time(path)? > built_at {
                return Ok(Some(RebuildReason::InputModified(path.clone())));
            }
        }

        Ok(None)
    }

    /// Failed analyses are returned as errors rather than read as "nothing
    /// changed", so the caller surfaces them as a failed build.
    pub async fn evaluate(
        &self,
        directory: &Path,
        state: &BuildState,
        backend: &dyn Backend,
        budget: &Budget,
    ) -> Result<BuildDecision> {
        if let Some(reason) = self.base_reason(state) {
            return Ok(BuildDecision::Rebuild {
                reason,
                analysis: None,
            });
        }

        let fresh = budget.run(backend.analyze(directory)).await??;
        if !fresh.succeeded {
            return Err(KilnError::analysis(directory, fresh.diagnostics.join("; ")));
        }

        match self.compare(state, &fresh)? {
            Some(reason) => Ok(BuildDecision::Rebuild {
                reason,
                analysis: Some(fresh),
            }),
            None => Ok(BuildDecision::Fresh),
        }
    }

    pub async fn should_build(
        &self,
        directory: &Path,
        state: &BuildState,
        backend: &dyn Backend,
        budget: &Budget,
    ) -> Result<bool> {
        Ok(self
            .evaluate(directory, state, backend, budget)
            .await?
            .should_build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::CompileInputSet;
    use crate::backend::Artifact;
    use crate::test_support::{touch, write_project, FakeBackend};
    use chrono::Utc;
    use std::time::Duration;

    fn built_state(dir: &Path, fresh: &AnalyzerResult) -> BuildState {
        let artifact_path = dir.join("build").join("app");
        std::fs::create_dir_all(artifact_path.parent().unwrap()).unwrap();
        std::fs::write(&artifact_path, "").unwrap();

        BuildState {
            last_analyzer_result: Some(fresh.clone()),
            last_successful_build_time_utc: Some(Utc::now()),
            artifact: Some(Artifact {
                path: artifact_path,
                project_dir: dir.to_path_buf(),
            }),
        }
    }

    #[tokio::test]
    async fn test_never_built_requires_build() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), &[("a.sh", "echo a")]);
        let backend = FakeBackend::new();
        let budget = Budget::unbounded("test");

        let decision = BuildCachePolicy::new()
            .evaluate(dir.path(), &BuildState::default(), &backend, &budget)
            .await
            .unwrap();

        assert_eq!(decision.reason(), Some(&RebuildReason::NeverBuilt));
        assert_eq!(backend.analysis_count(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_project_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), &[("a.sh", "echo a"), ("b.sh", "echo b")]);
        let backend = FakeBackend::new();
        let budget = Budget::unbounded("test");
        let fresh = backend.analyze(dir.path()).await.unwrap();
        let state = built_state(dir.path(), &fresh);

        let should_build = BuildCachePolicy::new()
            .should_build(dir.path(), &state, &backend, &budget)
            .await
            .unwrap();

        assert!(!should_build);
    }

    #[tokio::test]
    async fn test_missing_artifact_requires_build() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), &[("a.sh", "echo a")]);
        let backend = FakeBackend::new();
        let budget = Budget::unbounded("test");
        let fresh = backend.analyze(dir.path()).await.unwrap();
        let state = built_state(dir.path(), &fresh);
        std::fs::remove_file(&state.artifact.as_ref().unwrap().path).unwrap();

        let decision = BuildCachePolicy::new()
            .evaluate(dir.path(), &state, &backend, &budget)
            .await
            .unwrap();

        assert_eq!(decision.reason(), Some(&RebuildReason::ArtifactMissing));
    }

    #[tokio::test]
    async fn test_touched_input_requires_build() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), &[("a.sh", "echo a"), ("b.sh", "echo b")]);
        let backend = FakeBackend::new();
        let budget = Budget::unbounded("test");
        let fresh = backend.analyze(dir.path()).await.unwrap();
        let state = built_state(dir.path(), &fresh);

        touch(&dir.path().join("b.sh"), Duration::from_secs(5));

        let decision = BuildCachePolicy::new()
            .evaluate(dir.path(), &state, &backend, &budget)
            .await
            .unwrap();

        assert_eq!(
            decision.reason(),
            Some(&RebuildReason::InputModified(dir.path().join("b.sh")))
        );
    }

    #[tokio::test]
    async fn test_touched_descriptor_requires_build() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), &[("a.sh", "echo a")]);
        let backend = FakeBackend::new();
        let budget = Budget::unbounded("test");
        let fresh = backend.analyze(dir.path()).await.unwrap();
        let state = built_state(dir.path(), &fresh);

        touch(&dir.path().join("project.toml"), Duration::from_secs(5));

        let decision = BuildCachePolicy::new()
            .evaluate(dir.path(), &state, &backend, &budget)
            .await
            .unwrap();

        assert_eq!(decision.reason(), Some(&RebuildReason::DescriptorModified));
    }

    #[test]
    fn test_reordered_inputs_require_build() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), &[("a.sh", "echo a"), ("b.sh", "echo b")]);
        let a = dir.path().join("a.sh");
        let b = dir.path().join("b.sh");
        let descriptor = dir.path().join("project.toml");

        let cached = AnalyzerResult::succeeded(
            descriptor.clone(),
            CompileInputSet::new(vec![a.clone(), b.clone()]),
        );
        let reordered = AnalyzerResult::succeeded(descriptor, CompileInputSet::new(vec![b, a]));
        let state = built_state(dir.path(), &cached);

        let policy = BuildCachePolicy::new();
        assert_eq!(policy.compare(&state, &cached).unwrap(), None);
        assert_eq!(
            policy.compare(&state, &reordered).unwrap(),
            Some(RebuildReason::InputSetChanged)
        );
    }

    #[tokio::test]
    async fn test_removed_input_requires_build_without_touches() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), &[("a.sh", "echo a"), ("b.sh", "echo b")]);
        let backend = FakeBackend::new();
        let budget = Budget::unbounded("test");
        let fresh = backend.analyze(dir.path()).await.unwrap();
        let state = built_state(dir.path(), &fresh);

        std::fs::remove_file(dir.path().join("b.sh")).unwrap();

        let decision = BuildCachePolicy::new()
            .evaluate(dir.path(), &state, &backend, &budget)
            .await
            .unwrap();

        assert_eq!(decision.reason(), Some(&RebuildReason::InputSetChanged));
    }

    #[tokio::test]
    async fn test_failed_analysis_propagates() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), &[("a.sh", "echo a")]);
        let backend = FakeBackend::new();
        let budget = Budget::unbounded("test");
        let fresh = backend.analyze(dir.path()).await.unwrap();
        let state = built_state(dir.path(), &fresh);

        std::fs::write(dir.path().join("project.toml"), "[project\n").unwrap();

        let result = BuildCachePolicy::new()
            .evaluate(dir.path(), &state, &backend, &budget)
            .await;

        assert!(matches!(result, Err(KilnError::Analysis { .. })));
    }
}
