use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// Files that affect a project's compiled output, in the order the analyzer
/// emitted them. Equality is sequence equality: reordering counts as a change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileInputSet {
    paths: Vec<PathBuf>,
}

impl CompileInputSet {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }
}

impl FromIterator<PathBuf> for CompileInputSet {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerResult {
    pub project_descriptor_path: PathBuf,
    pub compile_inputs: CompileInputSet,
    pub succeeded: bool,
    pub diagnostics: Vec<String>,
}

impl AnalyzerResult {
    pub fn succeeded(project_descriptor_path: PathBuf, compile_inputs: CompileInputSet) -> Self {
        Self {
            project_descriptor_path,
            compile_inputs,
            succeeded: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn failed(project_descriptor_path: PathBuf, diagnostics: Vec<String>) -> Self {
        Self {
            project_descriptor_path,
            compile_inputs: CompileInputSet::default(),
            succeeded: false,
            diagnostics,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    pub project: ProjectSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
}

impl ProjectDescriptor {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read project descriptor: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse project descriptor: {}", path.display()))
    }
}

/// Reads a project descriptor and resolves the project's compile inputs.
///
/// Sources listed in the descriptor are taken in the listed order. Without a
/// list, the project directory is scanned for files carrying one of the
/// configured extensions, skipping hidden entries and the artifact directory.
#[derive(Debug, Clone)]
pub struct ProjectAnalyzer {
    descriptor_name: String,
    source_extensions: Vec<String>,
    artifact_dir: String,
}

impl ProjectAnalyzer {
    pub fn new(
        descriptor_name: impl Into<String>,
        source_extensions: Vec<String>,
        artifact_dir: impl Into<String>,
    ) -> Self {
        Self {
            descriptor_name: descriptor_name.into(),
            source_extensions,
            artifact_dir: artifact_dir.into(),
        }
    }

    pub fn descriptor_path(&self, directory: &Path) -> PathBuf {
        directory.join(&self.descriptor_name)
    }

    pub fn analyze(&self, directory: &Path) -> Result<AnalyzerResult> {
        let descriptor_path = self.descriptor_path(directory);

        if !descriptor_path.is_file() {
            return Err(KilnError::analysis(
                directory,
                format!("missing project descriptor {}", descriptor_path.display()),
            ));
        }

        let descriptor = match ProjectDescriptor::load(&descriptor_path) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                return Ok(AnalyzerResult::failed(
                    descriptor_path,
                    vec![format!("{e:#}")],
                ))
            }
        };

        match descriptor.project.sources {
            Some(sources) => {
                let mut inputs = Vec::with_capacity(sources.len());
                let mut missing = Vec::new();

                for source in sources {
                    let path = directory.join(&source);
                    if path.is_file() {
                        inputs.push(path);
                    } else {
                        missing.push(format!("source not found: {}", path.display()));
                    }
                }

                if !missing.is_empty() {
                    return Ok(AnalyzerResult::failed(descriptor_path, missing));
                }

                Ok(AnalyzerResult::succeeded(
                    descriptor_path,
                    CompileInputSet::new(inputs),
                ))
            }
            None => {
                let mut inputs = Vec::new();
                self.scan(directory, &mut inputs)?;
                inputs.sort();
                Ok(AnalyzerResult::succeeded(
                    descriptor_path,
                    CompileInputSet::new(inputs),
                ))
            }
        }
    }

    fn scan(&self, dir: &Path, inputs: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with('.') {
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if name != self.artifact_dir.as_str() {
                    self.scan(&path, inputs)?;
                }
            } else if file_type.is_file() && self.is_source(&path) {
                inputs.push(path);
            }
        }
        Ok(())
    }

    fn is_source(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.source_extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }
}

pub fn last_write_time(path: &Path) -> std::io::Result<DateTime<Utc>> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}
