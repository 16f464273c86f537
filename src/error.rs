//! Error kinds for the core, one variant family per §7 of the specification.
//!
//! Errors produced below the orchestrator are returned as `Result<_, CortexError>` with a
//! single-line diagnostic; the orchestrator aggregates per-plugin outcomes (§7) rather than
//! propagating the first error it sees.

use std::path::PathBuf;

use thiserror::Error;

/// Error kinds recognised by the core. Corresponds to the six kinds enumerated in §7;
/// measurement observation (deadline miss) and shutdown are not represented here because they
/// are not failures (they're `WindowRecord` fields and a clean-exit path respectively).
#[derive(Debug, Error)]
pub enum CortexError {
    /// Invalid configuration values, an unresolved plugin reference, or a schema violation.
    /// Surfaced before any plugin is loaded; the run does not start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Library open failure, missing mandatory symbol, ABI version mismatch, or `init` returning
    /// a null handle. The affected plugin is skipped; other `ready` plugins may still run.
    #[error("failed to load plugin '{plugin}': {reason}")]
    LoadFailure { plugin: String, reason: String },

    /// Allocation, thread creation, or file-open failure. Fatal to the affected run.
    #[error("resource failure: {0}")]
    ResourceFailure(String),

    /// A trainable plugin's `calibrate` returned a null state.
    #[error("calibration failed for plugin '{0}'")]
    CalibrationFailure(String),

    /// The on-disk calibration-state file failed one of the format checks in §6.
    #[error("invalid calibration state file {path:?}: {reason}")]
    InvalidCalibrationState { path: PathBuf, reason: String },

    /// An I/O failure during dataset replay or result writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CortexResult<T> = Result<T, CortexError>;
