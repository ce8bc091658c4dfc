// ABOUTME: Workflows run against the local process provider with plain shell stages
// ABOUTME: Exercises real file injection, command execution, and unit directory cleanup

use pretty_assertions::assert_eq;
use sandflow_orchestrator::{
    FailureKind, Orchestrator, OrchestratorSettings, OutputSource, PayloadShape, StageDefinition,
    Topology, WorkflowRequest,
};
use sandflow_sandbox::LocalProvider;
use serde_json::json;
use std::sync::Arc;

fn orchestrator() -> Orchestrator {
    Orchestrator::new(Arc::new(LocalProvider::new()), OrchestratorSettings::default())
}

#[tokio::test]
async fn test_local_pipeline_passes_input_files_between_units() {
    let orchestrator = orchestrator();

    let request = WorkflowRequest::new(
        Topology::Pipeline,
        vec![
            StageDefinition::new("echo", "cat \"$SANDFLOW_INPUT_PATH\""),
            StageDefinition::new("wrap", "printf '{\"stage\": \"%s\", \"got\": ' \"$SANDFLOW_STAGE\"; cat \"$SANDFLOW_INPUT_PATH\"; printf '}'")
                .with_output(OutputSource::Stdout, PayloadShape::Object),
        ],
    )
    .with_input(json!({ "value": 42 }));

    let result = orchestrator.run(request).await.unwrap();

    assert_eq!(
        result.output.payload,
        json!({ "stage": "wrap", "got": { "value": 42 } })
    );
    assert_eq!(orchestrator.live_units(), 0);
}

#[tokio::test]
async fn test_local_shared_unit_reads_staged_file_output() {
    let orchestrator = orchestrator();

    let request = WorkflowRequest::new(
        Topology::Shared,
        vec![
            StageDefinition::new("stage", "sh write.sh")
                .with_file("write.sh", "mkdir -p out && echo '[1, 2, 3]' > out/list.json")
                .with_output(OutputSource::Stdout, PayloadShape::Text),
            StageDefinition::new("read", "true").with_output(
                OutputSource::File {
                    path: "out/list.json".to_string(),
                },
                PayloadShape::Array,
            ),
        ],
    );

    let result = orchestrator.run(request).await.unwrap();

    assert_eq!(result.output.payload, json!([1, 2, 3]));
    assert_eq!(result.stages[0].payload, json!(""));
}

#[tokio::test]
async fn test_local_non_zero_exit_carries_stderr() {
    let orchestrator = orchestrator();

    let request = WorkflowRequest::new(
        Topology::Pipeline,
        vec![StageDefinition::new("boom", "echo 'something broke' >&2; exit 3")],
    );

    let failure = orchestrator.run(request).await.unwrap_err();

    assert_eq!(failure.kind, FailureKind::ExecutionFailed);
    assert_eq!(failure.exit_code, Some(3));
    assert_eq!(failure.stderr.as_deref().map(str::trim), Some("something broke"));
    assert_eq!(orchestrator.live_units(), 0);
}
