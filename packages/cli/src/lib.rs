// ABOUTME: Library half of the sandflow CLI: configuration and workflow file loading
// ABOUTME: Kept separate from the binary so both can be tested without a provider

pub mod config;
pub mod workflow;
