use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error categories of the engine.
///
/// Configuration and Hermiticity errors are fatal and never retried. Oracle
/// failures abort the running engine invocation with the underlying error
/// kept intact. Non-convergence is deliberately *not* represented here; it is
/// reported through the `converged` flag on results.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid control composition or malformed run settings.
    #[error("invalid configuration: {0}")]
    ControlConfig(String),

    /// A line descriptor whose endpoints do not close the loop.
    #[error("line endpoints differ by {delta:?}, which is not a reciprocal lattice vector")]
    OpenLoop { delta: [f64; 3] },

    /// A Hamiltonian or basis overlap matrix violating Hermitian symmetry
    /// beyond tolerance. Signals a probable oracle bug rather than a
    /// convergence problem.
    #[error("matrix is not hermitian: max asymmetry {max_diff:e} exceeds tolerance {tol:e}")]
    NonHermitian { max_diff: f64, tol: f64 },

    /// Failure inside the overlap oracle, propagated unmodified.
    #[error("oracle evaluation failed: {0}")]
    Oracle(#[from] anyhow::Error),

    /// Breakdown of an eigenvalue or singular value computation.
    #[error("numerical breakdown: {0}")]
    Numerical(String),

    /// No snapshot exists at the given path. Callers may treat this as
    /// "start fresh"; it is distinct from a broken snapshot.
    #[error("no snapshot found at {}", .path.display())]
    SnapshotMissing { path: PathBuf },

    /// A snapshot exists but could not be decoded.
    #[error("failed to decode snapshot: {0}")]
    SnapshotCodec(String),

    /// Reading or writing a snapshot failed at the filesystem level.
    #[error("snapshot I/O failed: {0}")]
    SnapshotIo(#[from] std::io::Error),

    /// Codec name not present in the registry.
    #[error("unknown codec '{0}'")]
    UnknownCodec(String),
}
