use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    /// Relative to the project root.
    pub path: PathBuf,
    pub content: String,
}

impl Buffer {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Source code submitted for a run, as received from a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub buffers: Vec<Buffer>,
}

fn default_mode() -> String {
    WorkspaceMode::Project.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceMode {
    Project,
    Script,
}

impl FromStr for WorkspaceMode {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(WorkspaceMode::Project),
            "script" => Ok(WorkspaceMode::Script),
            other => Err(KilnError::InvalidWorkspace(format!(
                "unrecognized mode `{other}`"
            ))),
        }
    }
}

impl fmt::Display for WorkspaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceMode::Project => write!(f, "project"),
            WorkspaceMode::Script => write!(f, "script"),
        }
    }
}

/// A workspace that passed validation, bound to the package it builds in.
#[derive(Debug, Clone)]
pub struct ValidatedWorkspace {
    pub package: String,
    pub mode: WorkspaceMode,
    pub buffers: Vec<Buffer>,
}

impl Workspace {
    pub fn project(name: impl Into<String>, buffers: Vec<Buffer>) -> Self {
        Self {
            project: Some(name.into()),
            mode: WorkspaceMode::Project.to_string(),
            buffers,
        }
    }

    pub fn script(buffers: Vec<Buffer>) -> Self {
        Self {
            project: None,
            mode: WorkspaceMode::Script.to_string(),
            buffers,
        }
    }

    pub fn validate(self, script_package: &str) -> Result<ValidatedWorkspace> {
        if self.buffers.is_empty() {
            return Err(KilnError::InvalidWorkspace("no buffers submitted".to_string()));
        }

        if self.buffers.iter().all(|b| b.content.trim().is_empty()) {
            return Err(KilnError::InvalidWorkspace("all buffers are empty".to_string()));
        }

        for buffer in &self.buffers {
            check_buffer_path(&buffer.path)?;
        }

        let mode: WorkspaceMode = self.mode.parse()?;
        let package = match mode {
            WorkspaceMode::Project => match self.project {
                Some(name) if !name.trim().is_empty() => name,
                _ => {
                    return Err(KilnError::InvalidWorkspace(
                        "project mode requires a project name".to_string(),
                    ))
                }
            },
            WorkspaceMode::Script => script_package.to_string(),
        };

        Ok(ValidatedWorkspace {
            package,
            mode,
            buffers: self.buffers,
        })
    }
}

fn check_buffer_path(path: &Path) -> Result<()> {
    let inside_root = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    if inside_root {
        Ok(())
    } else {
        Err(KilnError::InvalidWorkspace(format!(
            "buffer path `{}` must stay inside the project",
            path.display()
        )))
    }
}

impl ValidatedWorkspace {
    /// Writes buffers into `directory`, skipping those whose file already
    /// holds the same content. Returns how many files were written.
    pub async fn materialize(&self, directory: &Path) -> Result<usize> {
        let directory = directory.to_path_buf();
        let buffers = self.buffers.clone();

        tokio::task::spawn_blocking(move || write_buffers(&directory, &buffers))
            .await
            .context("materialize task panicked")?
    }
}

/// Each buffer is staged next to its target and renamed over it, so a reader
/// sees either the old file or the new one, even if the run is abandoned
/// half way through.
fn write_buffers(directory: &Path, buffers: &[Buffer]) -> Result<usize> {
    let mut written = 0;

    for buffer in buffers {
        let target = directory.join(&buffer.path);

        if fs::read(&target).is_ok_and(|existing| existing == buffer.content.as_bytes()) {
            continue;
        }

        let parent = target.parent().unwrap_or(directory);
        fs::create_dir_all(parent)?;

        let mut staged = tempfile::Builder::new()
            .prefix(".kiln-")
            .tempfile_in(parent)?;
        staged.write_all(buffer.content.as_bytes())?;
        staged.persist(&target).map_err(|e| e.error)?;
        written += 1;
    }

    tracing::debug!(directory = %directory.display(), written, "materialized buffers");
    Ok(written)
}
