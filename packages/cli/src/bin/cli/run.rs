// ABOUTME: `sandflow run`: load a workflow file, run it against a provider, print the report
// ABOUTME: The JSON report goes to stdout; the human summary and logs go to stderr

use anyhow::{bail, Context, Result};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use sandflow_cli::config::CliConfig;
use sandflow_cli::workflow::{load_workflow, stage_names, WorkflowOverrides};
use sandflow_orchestrator::{
    Orchestrator, OrchestratorSettings, RelayEnvelope, WorkflowFailure, WorkflowResult,
};
use serde_json::{json, Value};
use std::path::PathBuf;

pub struct RunArgs {
    pub file: PathBuf,
    pub provider: Option<String>,
    pub image: Option<String>,
    pub concurrency: Option<usize>,
    pub deadline_secs: Option<u64>,
    pub input: Option<String>,
    pub pretty: bool,
    pub events: bool,
}

/// Returns whether the workflow succeeded
pub async fn run_command(args: RunArgs) -> Result<bool> {
    let config = CliConfig::resolve(args.provider.as_deref(), args.image.as_deref())?;
    let settings = OrchestratorSettings::from_env().context("Invalid orchestrator settings")?;

    let input = args
        .input
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--input is not valid JSON")?;
    let overrides = WorkflowOverrides {
        concurrency: args.concurrency,
        deadline_secs: args.deadline_secs,
        input,
    };
    let request = load_workflow(&args.file, &overrides)?;

    let provider = config.build_provider()?;
    if !provider.is_available().await.unwrap_or(false) {
        bail!(
            "Provider '{}' is not available (run `sandflow providers` for details)",
            config.provider
        );
    }

    eprintln!(
        "{} {} workflow with {} on {}",
        "▶".cyan().bold(),
        request.topology.to_string().bold(),
        stage_names(&request).join(" → "),
        config.provider.to_string().cyan()
    );

    let orchestrator = Orchestrator::new(provider, settings);
    let outcome = orchestrator.run(request).await;
    let leaked = orchestrator.teardown().await;
    if leaked > 0 {
        eprintln!(
            "{} {} units were still live at teardown",
            "Warning:".yellow().bold(),
            leaked
        );
    }

    let (report, succeeded) = match outcome {
        Ok(result) => {
            print_success_summary(&result);
            (success_report(result, args.events), true)
        }
        Err(failure) => {
            print_failure_summary(&failure);
            (failure_report(failure, args.events), false)
        }
    };

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", rendered);
    Ok(succeeded)
}

fn success_report(result: WorkflowResult, include_events: bool) -> Value {
    let mut report = json!({
        "status": "succeeded",
        "workflow_id": result.workflow_id,
        "topology": result.topology,
        "output": result.output.payload,
        "stages": result.stages,
    });
    if let Some(state) = result.shared_state {
        report["shared_state"] = json!(state);
    }
    if include_events {
        report["events"] = json!(result.events);
    }
    report
}

fn failure_report(mut failure: WorkflowFailure, include_events: bool) -> Value {
    if !include_events {
        failure.events.clear();
    }
    json!({ "status": "failed", "failure": failure })
}

fn stage_table(stages: &[RelayEnvelope]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Seq", "Stage", "Output"]);

    for envelope in stages {
        let mut preview = envelope.payload.to_string();
        if preview.chars().count() > 60 {
            preview = format!("{}…", preview.chars().take(60).collect::<String>());
        }
        table.add_row(vec![
            envelope.sequence.to_string(),
            envelope.source.clone(),
            preview,
        ]);
    }
    table
}

fn print_success_summary(result: &WorkflowResult) {
    eprintln!(
        "{} Workflow {} completed ({} stage outputs)",
        "✓".green().bold(),
        result.workflow_id,
        result.stages.len()
    );
    if !result.stages.is_empty() {
        eprintln!("{}", stage_table(&result.stages));
    }
}

fn print_failure_summary(failure: &WorkflowFailure) {
    eprintln!("{} {}", "✗".red().bold(), failure.to_string().red());
    if let Some(code) = failure.exit_code {
        eprintln!("  exit code: {}", code);
    }
    if let Some(stderr) = &failure.stderr {
        eprintln!("  stderr:\n{}", stderr.dimmed());
    }
    if !failure.completed.is_empty() {
        eprintln!("  completed before failure:");
        eprintln!("{}", stage_table(&failure.completed));
    }
}
