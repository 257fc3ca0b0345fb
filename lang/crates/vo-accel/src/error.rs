//! Error types.
//!
//! [`AccelError`] covers startup: every variant is fatal to VM creation and its
//! Display text is what the host prints. [`DispatchError`] covers a single
//! bridged call and never touches unit state.

use thiserror::Error;

use crate::heap::ObjRef;

/// Startup failure.
#[derive(Debug, Error)]
pub enum AccelError {
    #[error("invalid accel unit option `{option}`: {reason}")]
    InvalidUnitSpec { option: String, reason: String },

    #[error("duplicate accel unit `{feature}`: `{duplicate}` conflicts with `{existing}`")]
    DuplicateUnit {
        feature: String,
        existing: String,
        duplicate: String,
    },

    #[error("duplicate native acceleration entry found for {entry} in unit `{unit}` (already registered by unit `{owner}`)")]
    DuplicateEntry {
        entry: String,
        unit: String,
        owner: String,
    },

    #[error("could not find accel unit `{unit}`: {reason}")]
    ModuleNotFound { unit: String, reason: String },

    #[error("accel unit `{unit}` does not export `{symbol}`")]
    MissingEntryPoint { unit: String, symbol: &'static str },

    #[error("invalid export table in accel unit `{unit}`: {reason}")]
    InvalidExportTable { unit: String, reason: String },

    #[error("calling convention of {entry} in accel unit `{unit}` does not match its descriptor: {reason}")]
    CallingConventionMismatch {
        unit: String,
        entry: String,
        reason: String,
    },

    #[error("failed to initialize accel unit `{unit}`: {message}")]
    InitFailed { unit: String, message: String },

    #[error("failed to post-initialize accel unit `{unit}`: {message}")]
    PostInitFailed { unit: String, message: String },
}

impl AccelError {
    pub(crate) fn invalid_spec(option: &str, reason: impl Into<String>) -> Self {
        AccelError::InvalidUnitSpec {
            option: option.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_table(unit: &str, reason: impl Into<String>) -> Self {
        AccelError::InvalidExportTable {
            unit: unit.to_string(),
            reason: reason.into(),
        }
    }

    /// Short kind name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AccelError::InvalidUnitSpec { .. } => "invalid-unit-spec",
            AccelError::DuplicateUnit { .. } => "duplicate-unit",
            AccelError::DuplicateEntry { .. } => "duplicate-entry",
            AccelError::ModuleNotFound { .. } => "module-not-found",
            AccelError::MissingEntryPoint { .. } => "missing-entry-point",
            AccelError::InvalidExportTable { .. } => "invalid-export-table",
            AccelError::CallingConventionMismatch { .. } => "calling-convention-mismatch",
            AccelError::InitFailed { .. } => "init-failed",
            AccelError::PostInitFailed { .. } => "post-init-failed",
        }
    }
}

/// Failure of one bridged call or its lowering, raised before the native
/// function runs.
#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("{method}: expected {expected} arguments, got {found}")]
    ArityMismatch {
        method: String,
        expected: usize,
        found: usize,
    },

    #[error("{method}: argument {index} expected {expected}, got {found}")]
    ArgumentMismatch {
        method: String,
        index: usize,
        expected: String,
        found: String,
    },

    #[error("{method}: null receiver")]
    NullReceiver { method: String },

    #[error("{method}: argument {index} is a null array")]
    NullArray { method: String, index: usize },

    #[error("{method}: returned address {address:#x} is not a managed reference")]
    UnknownReference { method: String, address: usize },

    #[error("{method}: returned reference has kind {found}, expected {expected}")]
    ReturnMismatch {
        method: String,
        expected: String,
        found: String,
    },

    #[error("{method}: owning unit `{unit}` is no longer loaded")]
    UnitUnloaded { method: String, unit: String },

    #[error("{method}: provider returned no native function for `{native}`")]
    NativeUnavailable { method: String, native: String },

    #[error("no native replacement registered for {0}")]
    NotReplaced(String),

    #[error("stale reference {0}")]
    InvalidReference(ObjRef),

    #[error("{0} is pinned")]
    StillPinned(ObjRef),

    #[error("{obj} is {found}, expected {expected}")]
    WrongKind {
        obj: ObjRef,
        expected: String,
        found: String,
    },
}
