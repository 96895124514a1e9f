//! The `winder_core` crate computes topological invariants (Z2 index,
//! Chern number) by tracking Wannier charge centers along adaptively
//! refined families of closed k-space loops.
//!
//! Key components:
//! - **Control**: capability traits classifying the objects that govern
//!   iterative refinement (data-consuming, iteration-producing,
//!   convergence-testing, stateful).
//! - **System**: the oracle boundary, returning eigenstates or overlap
//!   matrices for a list of k-points, plus a matrix-Hamiltonian
//!   implementation.
//! - **Line / Surface**: the adaptive engines, resumable from serialized
//!   snapshots.
//! - **Invariant**: Z2 and Chern extraction from converged surface data.
//! - **Io**: snapshot persistence with pluggable codecs.

pub mod control;
pub mod error;
pub mod invariant;
pub mod io;
pub mod line;
pub mod surface;
pub mod system;
pub mod wcc;

pub use error::{Error, Result};
pub use line::{run_line, run_line_with, LineResult, LineSettings};
pub use surface::{run_surface, run_surface_with, SurfaceResult, SurfaceSettings};
