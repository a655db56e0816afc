use super::RunHistoryEntry;
use anyhow::Context;
use std::fs;
use std::path::Path;

pub fn load_history(path: &Path) -> anyhow::Result<Vec<RunHistoryEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;

    let entries: Vec<RunHistoryEntry> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse history file: {}", path.display()))?;

    Ok(entries)
}

pub fn save_history(path: &Path, entries: &[RunHistoryEntry]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create history directory: {}", parent.display())
        })?;
    }

    let content =
        serde_json::to_string_pretty(entries).context("Failed to serialize run history")?;

    fs::write(path, content)
        .with_context(|| format!("Failed to write history file: {}", path.display()))?;

    Ok(())
}
