// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Sandflow

// Provider Selection
pub const SANDFLOW_PROVIDER: &str = "SANDFLOW_PROVIDER";
pub const SANDFLOW_DOCKER_IMAGE: &str = "SANDFLOW_DOCKER_IMAGE";
pub const SANDFLOW_DOCKER_PULL_TIMEOUT_SECS: &str = "SANDFLOW_DOCKER_PULL_TIMEOUT_SECS";

// Stage Execution
pub const SANDFLOW_STAGE_TIMEOUT_SECS: &str = "SANDFLOW_STAGE_TIMEOUT_SECS";
pub const SANDFLOW_INPUT_PATH: &str = "SANDFLOW_INPUT_PATH";

// Workflow Scheduling
pub const SANDFLOW_WORKFLOW_DEADLINE_SECS: &str = "SANDFLOW_WORKFLOW_DEADLINE_SECS";
pub const SANDFLOW_MAX_CONCURRENCY: &str = "SANDFLOW_MAX_CONCURRENCY";
pub const SANDFLOW_STRICT_PARALLELISM: &str = "SANDFLOW_STRICT_PARALLELISM";
pub const SANDFLOW_TEARDOWN_TIMEOUT_SECS: &str = "SANDFLOW_TEARDOWN_TIMEOUT_SECS";

// Logging
pub const SANDFLOW_LOG: &str = "SANDFLOW_LOG";

// Exported into every stage command
pub const SANDFLOW_INPUT: &str = "SANDFLOW_INPUT";
pub const SANDFLOW_STAGE: &str = "SANDFLOW_STAGE";
pub const SANDFLOW_WORKDIR: &str = "SANDFLOW_WORKDIR";

// Defaults
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_TEARDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_INPUT_PATH: &str = "input.json";
pub const DEFAULT_DOCKER_IMAGE: &str = "python:3.12-slim";
pub const DEFAULT_UNIT_WORKDIR: &str = "/workspace";
