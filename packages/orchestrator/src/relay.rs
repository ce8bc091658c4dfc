// ABOUTME: Relay channel moving stage output to the next consumer through orchestrator memory
// ABOUTME: Stamps envelopes with monotonic sequence numbers and validates payload shape per hop

use crate::types::PayloadShape;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

/// Source name used for payloads entering from the workflow caller
pub const WORKFLOW_INPUT_SOURCE: &str = "workflow_input";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Destination {
    Stage(String),
    External,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Stage(name) => write!(f, "stage '{}'", name),
            Destination::External => f.write_str("external"),
        }
    }
}

/// The only carrier of data across stage boundaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub source: String,
    pub destination: Destination,
    pub payload: Value,
    pub sequence: u64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("Malformed payload from '{from}' for {destination}: {reason}")]
    MalformedPayload {
        from: String,
        destination: Destination,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Default)]
pub struct RelayChannel {
    sequence: AtomicU64,
}

impl RelayChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Wrap a stage's decoded output; it stays undelivered until relayed
    pub fn capture(&self, source: &str, payload: Value) -> RelayEnvelope {
        let sequence = self.next_sequence();
        debug!(source, sequence, "Captured stage output");
        RelayEnvelope {
            source: source.to_string(),
            destination: Destination::External,
            payload,
            sequence,
        }
    }

    /// Wrap the workflow caller's input as an envelope
    pub fn ingress(&self, payload: Value) -> RelayEnvelope {
        self.capture(WORKFLOW_INPUT_SOURCE, payload)
    }

    /// Re-address an envelope to its next consumer
    ///
    /// The payload must satisfy `expected` or the hop fails; nothing is
    /// delivered in that case.
    pub fn relay(
        &self,
        envelope: RelayEnvelope,
        destination: Destination,
        expected: Option<PayloadShape>,
    ) -> Result<RelayEnvelope> {
        let RelayEnvelope {
            source: from,
            payload,
            ..
        } = envelope;

        if let Some(shape) = expected {
            if let Err(reason) = shape.validate(&payload) {
                return Err(RelayError::MalformedPayload {
                    from,
                    destination,
                    reason,
                });
            }
        }

        let sequence = self.next_sequence();
        debug!(source = %from, destination = %destination, sequence, "Relayed envelope");
        Ok(RelayEnvelope {
            source: from,
            destination,
            payload,
            sequence,
        })
    }
}
