//! Error types for the probabilistic-transcription pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for pipeline operations.
///
/// All three domain variants are fatal to a run: the orchestrator halts on
/// the first one, leaves every artifact written so far intact, and reports
/// the failing stage. Recovery is manual (fix the cause, re-invoke with
/// `startstage` set to the first incomplete stage).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid settings, required data files, or run-mode
    /// sequencing (e.g. evaluation before any development run).
    #[error("config error: {0}")]
    Config(String),

    /// An external tool exited non-zero or failed to produce a declared
    /// output. Carries the captured stderr for diagnostics.
    #[error("tool {tool} failed ({status}): {stderr}")]
    Tool {
        tool: String,
        status: String,
        stderr: String,
    },

    /// A declared artifact does not exist when the orchestrator checks for
    /// it: an input absent at stage entry (typically an incorrectly chosen
    /// `startstage`), or an output absent after the stage returned.
    #[error("missing artifact: {path}")]
    ArtifactMissing { path: PathBuf },

    /// Wrapper identifying which stage a failure occurred in.
    #[error("stage {ordinal} ({name}) failed: {source}")]
    Stage {
        ordinal: u32,
        name: &'static str,
        #[source]
        source: Box<PipelineError>,
    },

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// A tool that ran but produced unusable or missing output.
    pub fn tool_output(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            status: "bad output".to_string(),
            stderr: detail.into(),
        }
    }
}

/// Result type alias for pipeline operations.
pub type PtResult<T> = Result<T, PipelineError>;
