// ABOUTME: Workflow definition files: JSON documents deserialized into workflow requests
// ABOUTME: Stage scripts may be referenced by path and are inlined relative to the file

use anyhow::{bail, Context, Result};
use sandflow_orchestrator::{StageDefinition, WorkflowRequest};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// On-disk staged file: inline `contents` or a `source` path next to the
/// workflow file
#[derive(Debug, Deserialize)]
struct FileEntry {
    path: String,
    #[serde(default)]
    contents: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

/// Overrides supplied on the command line
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkflowOverrides {
    pub concurrency: Option<usize>,
    pub deadline_secs: Option<u64>,
    pub input: Option<Value>,
}

pub fn load_workflow(path: &Path, overrides: &WorkflowOverrides) -> Result<WorkflowRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_workflow(&raw, base, overrides)
        .with_context(|| format!("Invalid workflow file {}", path.display()))
}

pub fn parse_workflow(
    raw: &str,
    base: &Path,
    overrides: &WorkflowOverrides,
) -> Result<WorkflowRequest> {
    let mut document: Value = serde_json::from_str(raw).context("Workflow is not valid JSON")?;

    if let Some(stages) = document.get_mut("stages").and_then(Value::as_array_mut) {
        for stage in stages.iter_mut() {
            inline_files(stage, base)?;
        }
    }
    if let Some(coordinator) = document.get_mut("coordinator") {
        if !coordinator.is_null() {
            inline_files(coordinator, base)?;
        }
    }

    let mut request: WorkflowRequest =
        serde_json::from_value(document).context("Workflow does not match the expected schema")?;

    if let Some(concurrency) = overrides.concurrency {
        request.concurrency = Some(concurrency);
    }
    if let Some(deadline) = overrides.deadline_secs {
        request.deadline_secs = Some(deadline);
    }
    if let Some(input) = &overrides.input {
        request.input = input.clone();
    }

    if let Err(reason) = request.validate() {
        bail!(reason);
    }
    Ok(request)
}

/// Replace `source` references with file contents so the request only
/// carries inline files
fn inline_files(stage: &mut Value, base: &Path) -> Result<()> {
    let name = stage
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    let Some(files) = stage.get_mut("files") else {
        return Ok(());
    };

    let entries: Vec<FileEntry> = serde_json::from_value(files.take())
        .with_context(|| format!("Stage '{}' has malformed files", name))?;

    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        let contents = match (entry.contents, entry.source) {
            (Some(contents), None) => contents,
            (None, Some(source)) => {
                let source_path = base.join(&source);
                let contents = fs::read_to_string(&source_path).with_context(|| {
                    format!(
                        "Stage '{}' references missing file {}",
                        name,
                        source_path.display()
                    )
                })?;
                debug!(stage = %name, source = %source_path.display(), "Inlined staged file");
                contents
            }
            _ => bail!(
                "Stage '{}' file '{}' needs exactly one of 'contents' or 'source'",
                name,
                entry.path
            ),
        };
        let mut file = HashMap::new();
        file.insert("path", entry.path);
        file.insert("contents", contents);
        resolved.push(file);
    }

    *files = serde_json::to_value(resolved)?;
    Ok(())
}

/// Stage names in dispatch order, coordinator last
pub fn stage_names(request: &WorkflowRequest) -> Vec<&str> {
    request
        .stages
        .iter()
        .chain(request.coordinator.iter())
        .map(|stage: &StageDefinition| stage.name.as_str())
        .collect()
}
