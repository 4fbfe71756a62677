// SPDX-License-Identifier: Apache-2.0
//! Unified error type for the fabric's components.

use thiserror::Error;

/// Errors surfaced by the ledger, registry, staging pipeline, tokens, and
/// persistence components. Each variant names a specific, checkable failure
/// mode rather than wrapping an opaque message, so callers can match on it.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Referenced node id has no snapshot in the ledger.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// Referenced node exists but was deleted (no longer active).
    #[error("node not active: {0}")]
    NodeNotActive(String),

    /// Referenced slot id or address has no binding in the registry.
    #[error("unknown slot: {0}")]
    UnknownSlot(String),

    /// Referenced engine letter or language name does not match any row.
    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    /// An engine row is full; no position is free to reserve.
    #[error("engine row full: {0}")]
    RowFull(String),

    /// Operation denied by a slot or row's permission bits.
    #[error("permission denied: {0} on {1}")]
    PermissionDenied(&'static str, String),

    /// Referenced staging id has no record in the staging pipeline.
    #[error("unknown staging id: {0}")]
    UnknownStagingId(String),

    /// Staging operation attempted from a phase that does not allow it.
    #[error("invalid staging transition: {0} cannot {1}")]
    InvalidStagingTransition(String, &'static str),

    /// Referenced marshal token is unknown, expired, or already revoked.
    #[error("invalid or expired token: {0}")]
    InvalidToken(String),

    /// Persistence I/O failure (checkpoint write or restore).
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Mesh relay network failure talking to a peer.
    #[error("mesh relay error: {0}")]
    MeshRelay(String),

    /// Underlying I/O failure not covered by a more specific variant.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// No executor is configured for this language's engine.
    #[error("no executor configured for: {0}")]
    ExecutorUnavailable(String),

    /// A configured executor failed to run at all (spawn failure, process
    /// wait error) — distinct from the user code it was running simply
    /// exiting non-zero, which is a normal speculative outcome, not this.
    #[error("executor failed: {0}")]
    ExecutorFailed(String),

    /// The target of the operation is already occupied by something else.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl FabricError {
    /// Collapse the variant into one of the nine error-taxonomy kinds used
    /// on the wire surface, rather than a variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            FabricError::UnknownNode(_)
            | FabricError::UnknownSlot(_)
            | FabricError::UnknownStagingId(_) => "not-found",
            FabricError::NodeNotActive(_) | FabricError::InvalidStagingTransition(..) => "invalid-phase",
            FabricError::RowFull(_) => "capacity-exhausted",
            FabricError::PermissionDenied(..) => "permission-denied",
            FabricError::UnknownEngine(_) => "input-invalid",
            FabricError::InvalidToken(_) => "not-found",
            FabricError::Persistence(_) | FabricError::Io(_) | FabricError::MeshRelay(_) => "io-failed",
            FabricError::Serde(_) => "io-failed",
            FabricError::ExecutorUnavailable(_) => "executor-unavailable",
            FabricError::ExecutorFailed(_) => "executor-failed",
            FabricError::Conflict(_) => "conflict",
        }
    }
}
