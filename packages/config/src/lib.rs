// ABOUTME: Shared configuration surface for Sandflow packages
// ABOUTME: Re-exports environment variable names and their documented defaults

pub mod constants;

pub use constants::*;
