// ABOUTME: End-to-end topology tests driven through the scripted in-memory provider
// ABOUTME: Covers relay ordering, fan-in aggregation, claim exclusivity, and degradation

use pretty_assertions::assert_eq;
use sandflow_orchestrator::{
    Destination, EventKind, FailureKind, Orchestrator, OrchestratorSettings, OutputSource,
    PayloadShape, PipelineUnits, StageDefinition, StateError, Topology, WorkflowRequest,
    WorkflowState,
};
use sandflow_sandbox::testing::{ScriptOutput, ScriptedProvider};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(provider: &Arc<ScriptedProvider>) -> Orchestrator {
    Orchestrator::new(provider.clone(), OrchestratorSettings::default())
}

fn numbers(value: &Value, key: &str) -> Vec<f64> {
    value[key]
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

fn sales_provider() -> ScriptedProvider {
    ScriptedProvider::new()
        .on_command("python3 load.py", |ctx| {
            let input = ctx.input().unwrap_or_default();
            ScriptOutput::json(&json!({ "sales": input["sales"] }))
        })
        .on_command("python3 analyze.py", |ctx| {
            let sales = numbers(&ctx.input().unwrap_or_default(), "sales");
            let total: f64 = sales.iter().sum();
            let max = sales.iter().cloned().fold(f64::MIN, f64::max);
            ScriptOutput::json(&json!({
                "total": total as i64,
                "average": total / sales.len() as f64,
                "max": max as i64,
            }))
        })
        .on_command("python3 report.py", |ctx| {
            let stats = ctx.input().unwrap_or_default();
            let report = format!(
                "Total: {}, Average: {:.2}, Max: {}",
                stats["total"],
                stats["average"].as_f64().unwrap_or_default(),
                stats["max"]
            );
            ScriptOutput::json(&json!({ "stats": stats, "report": report }))
        })
}

fn sales_pipeline() -> WorkflowRequest {
    let object = |name: &str, command: &str| {
        StageDefinition::new(name, command).with_output(OutputSource::Stdout, PayloadShape::Object)
    };
    WorkflowRequest::new(
        Topology::Pipeline,
        vec![
            object("load", "python3 load.py"),
            object("analyze", "python3 analyze.py").with_input_shape(PayloadShape::Object),
            object("report", "python3 report.py"),
        ],
    )
    .with_input(json!({ "sales": [100, 150, 200, 180, 220] }))
}

#[tokio::test]
async fn test_pipeline_relays_each_output_to_the_next_stage() {
    let provider = Arc::new(sales_provider());
    let orchestrator = orchestrator(&provider);

    let result = orchestrator.run(sales_pipeline()).await.unwrap();

    assert_eq!(
        result.output.payload["stats"],
        json!({ "total": 850, "average": 170.0, "max": 220 })
    );
    let report = result.output.payload["report"].as_str().unwrap();
    assert!(report.contains("170.00"), "report was {}", report);
    assert_eq!(result.output.source, "report");
    assert_eq!(result.output.destination, Destination::External);

    let sources: Vec<&str> = result.stages.iter().map(|e| e.source.as_str()).collect();
    assert_eq!(sources, vec!["load", "analyze", "report"]);
    assert!(result
        .stages
        .windows(2)
        .all(|pair| pair[0].sequence < pair[1].sequence));

    // one fresh unit per stage, each released before the next is acquired
    assert_eq!(provider.created_count(), 3);
    let handles: HashSet<String> = provider.invocations().into_iter().map(|(h, _)| h).collect();
    assert_eq!(handles.len(), 3);
    assert_eq!(provider.live_count(), 0);
    assert_eq!(orchestrator.live_units(), 0);
}

#[tokio::test]
async fn test_pipeline_preprovisioned_and_shared_unit_policies() {
    for (policy, expected_units) in [
        (PipelineUnits::PerStagePreprovisioned, 3),
        (PipelineUnits::Shared, 1),
    ] {
        let provider = Arc::new(sales_provider());
        let orchestrator = orchestrator(&provider);

        let result = orchestrator
            .run(sales_pipeline().with_pipeline_units(policy))
            .await
            .unwrap();

        assert_eq!(result.output.payload["stats"]["total"], json!(850));
        assert_eq!(provider.created_count(), expected_units);
        assert_eq!(provider.live_count(), 0);
    }
}

#[tokio::test]
async fn test_preprovisioned_pipeline_releases_later_units_on_failure() {
    let provider = Arc::new(
        sales_provider().on_command("python3 analyze.py", |_| ScriptOutput::fail(2, "bad data")),
    );
    let orchestrator = orchestrator(&provider);

    let failure = orchestrator
        .run(sales_pipeline().with_pipeline_units(PipelineUnits::PerStagePreprovisioned))
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::ExecutionFailed);
    assert_eq!(failure.stage.as_deref(), Some("analyze"));
    assert_eq!(provider.created_count(), 3);
    assert_eq!(provider.live_count(), 0);
    assert_eq!(orchestrator.live_units(), 0);
    let commands: Vec<String> = provider.invocations().into_iter().map(|(_, c)| c).collect();
    assert_eq!(commands, vec!["python3 load.py", "python3 analyze.py"]);
}

#[tokio::test]
async fn test_pipeline_halts_at_malformed_output() {
    let provider = Arc::new(
        sales_provider().on_command("python3 analyze.py", |_| ScriptOutput::stdout("not json")),
    );
    let orchestrator = orchestrator(&provider);

    let failure = orchestrator.run(sales_pipeline()).await.unwrap_err();

    assert_eq!(failure.kind, FailureKind::MalformedOutput);
    assert_eq!(failure.stage.as_deref(), Some("analyze"));
    assert_eq!(failure.completed.len(), 1);
    assert_eq!(failure.completed[0].source, "load");
    assert!(!provider
        .invocations()
        .iter()
        .any(|(_, command)| command == "python3 report.py"));
    assert_eq!(provider.live_count(), 0);
    assert_eq!(orchestrator.live_units(), 0);
}

#[tokio::test]
async fn test_pipeline_reports_exit_code_and_stderr() {
    let provider = Arc::new(sales_provider().on_command("python3 analyze.py", |_| {
        ScriptOutput::fail(2, "ZeroDivisionError: division by zero")
    }));
    let orchestrator = orchestrator(&provider);

    let failure = orchestrator.run(sales_pipeline()).await.unwrap_err();

    assert_eq!(failure.kind, FailureKind::ExecutionFailed);
    assert_eq!(failure.stage.as_deref(), Some("analyze"));
    assert_eq!(failure.exit_code, Some(2));
    assert!(failure.stderr.unwrap().contains("ZeroDivisionError"));
    assert!(matches!(
        failure.events.last().map(|e| &e.kind),
        Some(EventKind::UnitReleased { .. })
    ));
}

#[tokio::test]
async fn test_pipeline_rejects_payload_of_wrong_shape() {
    let provider = Arc::new(
        sales_provider().on_command("python3 load.py", |_| ScriptOutput::json(&json!([1, 2]))),
    );
    let mut request = sales_pipeline();
    request.stages[0].output.shape = PayloadShape::Any;

    let failure = orchestrator(&provider).run(request).await.unwrap_err();

    assert_eq!(failure.kind, FailureKind::MalformedPayload);
    assert_eq!(failure.stage.as_deref(), Some("analyze"));
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test]
async fn test_shared_topology_stages_see_each_others_files() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_command("python3 prepare.py", |ctx| {
                let input = ctx.input().unwrap_or_default();
                ctx.write("data.json", input.to_string());
                ScriptOutput::json(&json!({ "written": true }))
            })
            .on_command("python3 consume.py", |ctx| {
                let data = ctx.read_json("data.json").unwrap_or_default();
                ScriptOutput::json(&json!({ "count": data["items"].as_array().map(Vec::len) }))
            }),
    );
    let orchestrator = orchestrator(&provider);

    let request = WorkflowRequest::new(
        Topology::Shared,
        vec![
            StageDefinition::new("prepare", "python3 prepare.py"),
            StageDefinition::new("consume", "python3 consume.py"),
        ],
    )
    .with_input(json!({ "items": [1, 2, 3] }));

    let result = orchestrator.run(request).await.unwrap();

    assert_eq!(result.output.payload, json!({ "count": 3 }));
    assert_eq!(result.stages.len(), 2);
    assert_eq!(provider.created_count(), 1);
    assert_eq!(provider.live_count(), 0);
}

fn stats_provider() -> ScriptedProvider {
    ScriptedProvider::new()
        .on_command_delayed("python3 sum.py", Duration::from_millis(300), |ctx| {
            let values = numbers(&ctx.input().unwrap_or_default(), "values");
            ScriptOutput::json(&json!(values.iter().sum::<f64>() as i64))
        })
        .on_command_delayed("python3 product.py", Duration::from_millis(100), |ctx| {
            let values = numbers(&ctx.input().unwrap_or_default(), "values");
            ScriptOutput::json(&json!(values.iter().product::<f64>() as i64))
        })
        .on_command_delayed("python3 average.py", Duration::from_millis(200), |ctx| {
            let values = numbers(&ctx.input().unwrap_or_default(), "values");
            ScriptOutput::json(&json!(values.iter().sum::<f64>() / values.len() as f64))
        })
}

fn stats_request() -> WorkflowRequest {
    WorkflowRequest::new(
        Topology::Parallel,
        vec![
            StageDefinition::new("sum", "python3 sum.py")
                .with_input(json!({ "values": [1, 2, 3, 4, 5] })),
            StageDefinition::new("product", "python3 product.py")
                .with_input(json!({ "values": [2, 3, 4] })),
            StageDefinition::new("average", "python3 average.py")
                .with_input(json!({ "values": [10, 20, 30, 40] })),
        ],
    )
}

#[tokio::test(start_paused = true)]
async fn test_parallel_aggregates_in_dispatch_order() {
    let provider = Arc::new(stats_provider());
    let orchestrator = orchestrator(&provider);

    let result = orchestrator.run(stats_request()).await.unwrap();

    assert_eq!(
        result.output.payload,
        json!({ "results": [15, 24, 25.0], "failed": [] })
    );
    assert_eq!(provider.peak_concurrency(), 3);

    let finish_order: Vec<&str> = result
        .events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StageSucceeded { stage, .. } => Some(stage.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(finish_order, vec!["product", "average", "sum"]);
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_branch_failure_does_not_cancel_siblings() {
    let provider = Arc::new(
        stats_provider().on_command("python3 product.py", |_| ScriptOutput::fail(1, "overflow")),
    );
    let orchestrator = orchestrator(&provider);

    let result = orchestrator.run(stats_request()).await.unwrap();

    assert_eq!(result.output.payload["results"], json!([15, 25.0]));
    let failed = result.output.payload["failed"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["index"], json!(1));
    assert_eq!(failed[0]["stage"], json!("product"));
    assert_eq!(failed[0]["kind"], json!("execution_failed"));
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_coordinator_receives_fan_in() {
    let provider = Arc::new(stats_provider().on_command("python3 combine.py", |ctx| {
        let input = ctx.input().unwrap_or_default();
        let results = numbers(&input, "results");
        ScriptOutput::json(&json!({ "combined": results.iter().sum::<f64>() }))
    }));
    let orchestrator = orchestrator(&provider);

    let request = stats_request().with_coordinator(
        StageDefinition::new("combine", "python3 combine.py").with_input_shape(PayloadShape::Object),
    );
    let result = orchestrator.run(request).await.unwrap();

    assert_eq!(result.output.source, "combine");
    assert_eq!(result.output.payload, json!({ "combined": 64.0 }));
    // the coordinator reuses one of the lane units
    assert_eq!(provider.created_count(), 3);
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_degrades_to_available_capacity() {
    let provider = Arc::new(stats_provider().with_capacity(2));
    let orchestrator = orchestrator(&provider);

    let result = orchestrator.run(stats_request()).await.unwrap();

    assert_eq!(result.output.payload["results"], json!([15, 24, 25.0]));
    assert!(provider.peak_concurrency() <= 2);
    assert!(result.events.iter().any(|e| e.kind
        == EventKind::Degraded {
            requested: 3,
            acquired: 2
        }));
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_strict_parallelism_fails_on_shortfall() {
    let provider = Arc::new(stats_provider().with_capacity(2));
    let orchestrator = orchestrator(&provider);

    let failure = orchestrator
        .run(stats_request().with_strict_parallelism(true))
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::InsufficientCapacity);
    assert!(provider.invocations().is_empty());
    assert_eq!(provider.live_count(), 0);
    assert_eq!(orchestrator.live_units(), 0);
}

#[tokio::test]
async fn test_no_capacity_is_a_provision_failure() {
    let provider = Arc::new(stats_provider().with_capacity(0));

    let failure = orchestrator(&provider).run(stats_request()).await.unwrap_err();

    assert_eq!(failure.kind, FailureKind::Provision);
    assert_eq!(provider.created_count(), 0);
}

#[tokio::test]
async fn test_reused_unit_does_not_leak_previous_output_file() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_command("python3 first.py", |ctx| {
                ctx.write("out.json", json!({ "from": "first" }).to_string());
                ScriptOutput::stdout("")
            })
            .on_command("python3 second.py", |_| ScriptOutput::stdout("")),
    );
    let orchestrator = orchestrator(&provider);

    let to_file = |name: &str, command: &str| {
        StageDefinition::new(name, command).with_output(
            OutputSource::File {
                path: "out.json".to_string(),
            },
            PayloadShape::Object,
        )
    };
    let request = WorkflowRequest::new(
        Topology::Parallel,
        vec![to_file("a", "python3 first.py"), to_file("b", "python3 second.py")],
    )
    .with_concurrency(1);

    let result = orchestrator.run(request).await.unwrap();

    assert_eq!(provider.created_count(), 1);
    assert_eq!(result.output.payload["results"], json!([{ "from": "first" }]));
    let failed = result.output.payload["failed"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["stage"], json!("b"));
    assert_eq!(failed[0]["kind"], json!("io"));
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test]
async fn test_parallel_with_every_branch_rejected_still_finishes() {
    let provider = Arc::new(ScriptedProvider::new().on_command("python3 keys.py", |_| {
        ScriptOutput::json(&json!({}))
    }));
    let orchestrator = orchestrator(&provider);

    let request = WorkflowRequest::new(
        Topology::Parallel,
        vec![StageDefinition::new("keys", "python3 keys.py").with_input_shape(PayloadShape::Object)],
    )
    .with_input(json!(7));

    let result = orchestrator.run(request).await.unwrap();

    assert_eq!(result.output.payload["results"], json!([]));
    assert_eq!(result.output.payload["failed"][0]["kind"], json!("malformed_payload"));
    assert!(provider.invocations().is_empty());
    let last_state = result.events.iter().rev().find_map(|e| match &e.kind {
        EventKind::StateChanged { to, .. } => Some(to.clone()),
        _ => None,
    });
    assert_eq!(last_state, Some(WorkflowState::Done));
    assert_eq!(provider.live_count(), 0);
}

fn squares_provider(task_count: usize) -> ScriptedProvider {
    ScriptedProvider::new()
        .on_command("python3 plan.py", move |_| {
            let lines: Vec<String> = (1..=task_count)
                .map(|n| json!({ "n": n }).to_string())
                .collect();
            ScriptOutput::stdout(lines.join("\n"))
        })
        .on_command_delayed("python3 square.py", Duration::from_millis(50), |ctx| {
            let n = ctx.input().unwrap_or_default()["n"].as_i64().unwrap_or_default();
            ScriptOutput::json(&json!({ "n": n, "square": n * n }))
        })
}

fn squares_request() -> WorkflowRequest {
    WorkflowRequest::new(
        Topology::MasterWorker,
        vec![
            StageDefinition::new("plan", "python3 plan.py")
                .with_output(OutputSource::Stdout, PayloadShape::TaskList),
            StageDefinition::new("square", "python3 square.py")
                .with_input_shape(PayloadShape::Object),
        ],
    )
}

#[tokio::test(start_paused = true)]
async fn test_master_worker_claims_each_task_once() {
    let provider = Arc::new(squares_provider(4));
    let orchestrator = orchestrator(&provider);

    let result = orchestrator
        .run(squares_request().with_concurrency(3))
        .await
        .unwrap();

    let squares: Vec<i64> = result.output.payload["results"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["square"].as_i64())
        .collect();
    assert_eq!(squares, vec![1, 4, 9, 16]);
    assert_eq!(result.output.payload["failed"], json!([]));
    assert_eq!(result.output.payload["unprocessed"], json!([]));

    let claims: Vec<(String, String)> = result
        .events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TaskClaimed { task_id, worker } => Some((task_id.clone(), worker.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(claims.len(), 4);
    let distinct: HashSet<&String> = claims.iter().map(|(task, _)| task).collect();
    assert_eq!(distinct.len(), 4);
    let workers: HashSet<&String> = claims.iter().map(|(_, worker)| worker).collect();
    assert_eq!(workers.len(), 3);

    let state = result.shared_state.unwrap();
    assert_eq!(state.completed.len(), 4);
    assert!(state.pending.is_empty());
    assert!(state.in_flight.is_empty());

    // master unit plus three workers, and the queue is gone afterwards
    assert_eq!(provider.created_count(), 4);
    assert_eq!(provider.live_count(), 0);
    assert!(orchestrator
        .state()
        .read_snapshot(&format!("{}/tasks", result.workflow_id))
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn test_master_worker_budget_leaves_tasks_unprocessed() {
    let provider = Arc::new(squares_provider(5));
    let orchestrator = orchestrator(&provider);

    let result = orchestrator
        .run(squares_request().with_concurrency(2).with_task_budget(3))
        .await
        .unwrap();

    assert_eq!(
        result.output.payload["results"].as_array().map(Vec::len),
        Some(3)
    );
    assert_eq!(
        result.output.payload["unprocessed"],
        json!([{ "n": 4 }, { "n": 5 }])
    );
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_master_worker_failed_task_is_not_retried() {
    let provider = Arc::new(squares_provider(3).on_command("python3 square.py", |ctx| {
        let n = ctx.input().unwrap_or_default()["n"].as_i64().unwrap_or_default();
        if n == 2 {
            return ScriptOutput::fail(1, "bad task");
        }
        ScriptOutput::json(&json!({ "n": n, "square": n * n }))
    }));
    let orchestrator = orchestrator(&provider);

    let result = orchestrator
        .run(squares_request().with_concurrency(1))
        .await
        .unwrap();

    assert_eq!(result.output.payload["failed"][0]["task_id"], json!("task-1"));
    assert_eq!(
        result.output.payload["results"].as_array().map(Vec::len),
        Some(2)
    );
    let state = result.shared_state.unwrap();
    assert_eq!(state.failed, vec!["task-1".to_string()]);
    let square_runs = provider
        .invocations()
        .iter()
        .filter(|(_, command)| command == "python3 square.py")
        .count();
    assert_eq!(square_runs, 3);
}

#[tokio::test]
async fn test_master_worker_rejects_non_list_plan() {
    let provider = Arc::new(
        squares_provider(0).on_command("python3 plan.py", |_| ScriptOutput::stdout("42")),
    );
    let orchestrator = orchestrator(&provider);

    let failure = orchestrator.run(squares_request()).await.unwrap_err();

    assert_eq!(failure.kind, FailureKind::MalformedOutput);
    assert_eq!(failure.stage.as_deref(), Some("plan"));
    assert_eq!(provider.live_count(), 0);
    // the plan failed before any task queue was created
    assert!(matches!(
        orchestrator
            .state()
            .read_snapshot(&format!("{}/tasks", failure.workflow_id)),
        Err(StateError::UnknownQueue(_))
    ));
}

#[tokio::test]
async fn test_master_worker_empty_plan_runs_no_workers() {
    let provider = Arc::new(squares_provider(0));
    let orchestrator = orchestrator(&provider);

    let result = orchestrator.run(squares_request()).await.unwrap();

    assert_eq!(
        result.output.payload,
        json!({ "results": [], "failed": [], "unprocessed": [] })
    );
    assert_eq!(provider.created_count(), 1);
}

#[tokio::test]
async fn test_successful_run_ends_in_done() {
    let provider = Arc::new(sales_provider());

    let result = orchestrator(&provider).run(sales_pipeline()).await.unwrap();

    let states: Vec<WorkflowState> = result
        .events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StateChanged { to, .. } => Some(to.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(states.first(), Some(&WorkflowState::Provisioning));
    assert_eq!(
        &states[states.len() - 3..],
        &[
            WorkflowState::Collecting,
            WorkflowState::Teardown,
            WorkflowState::Done
        ]
    );
}
