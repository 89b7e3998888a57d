// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the scale pipeline.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::reading::{IdentifiedReading, ScriptStatus};
use crate::resilience::reconnect::ConnectionStatus;
use crate::store::traits::StoreError;

/// Invoked once per distinct physical reading per scope lifetime.
pub type NewReadingCallback = Arc<dyn Fn(&IdentifiedReading) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Pipeline has no active scope")]
    NotStarted,
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: StoreError },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Whether the user has to act (refresh) before anything recovers.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

/// Point-in-time snapshot of pipeline state.
///
/// Cheap to build (no I/O); suitable for a status endpoint or a UI banner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineHealth {
    /// Active trainer, `None` when idle
    pub trainer_id: Option<String>,
    pub connection_status: ConnectionStatus,
    /// Human-readable supervisor state, e.g. `Disconnected(retries=2)`
    pub connection_state: String,
    pub script_status: ScriptStatus,
    pub is_listening: bool,
    pub is_loading_initial: bool,
    pub is_stabilizing: bool,
    pub cached_readings: usize,
    /// Present when the retry budget is spent
    pub failure: Option<String>,
}

impl PipelineHealth {
    /// Receiving live readings without needing user action.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.is_listening && self.failure.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pipeline_error_display() {
        let err = PipelineError::RetriesExhausted {
            attempts: 6,
            last_error: StoreError::Timeout(Duration::from_secs(10)),
        };
        assert_eq!(
            err.to_string(),
            "Connection failed after 6 attempts: Subscription not acknowledged within 10s"
        );
        assert!(err.is_terminal());
        assert!(!PipelineError::NotStarted.is_terminal());
    }

    #[test]
    fn test_store_error_converts() {
        let err: PipelineError = StoreError::Query("boom".into()).into();
        assert_eq!(err.to_string(), "Query failed: boom");
    }
}
