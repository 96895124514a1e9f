//! Capability traits for the controls that govern iterative refinement.
//!
//! Controls are classified by what they can do (consume data, produce
//! iteration options, test convergence, snapshot state) and by the level
//! they apply to (line, surface, volume). The concrete controls live next
//! to the engine they serve; the containers there are tagged unions, so the
//! universal-type check of the container is done by the compiler and only
//! composition mistakes remain as runtime configuration errors.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Applicability level of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ControlLevel {
    Line,
    Surface,
    Volume,
}

/// Options assembled from all iteration controls for one refinement cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Number of k-points to sample along the line.
    pub num_points: Option<usize>,
}

impl RunOptions {
    /// Later controls win for fields they set; unset fields fall through.
    pub fn merge(self, other: RunOptions) -> RunOptions {
        RunOptions {
            num_points: other.num_points.or(self.num_points),
        }
    }
}

/// Consumes freshly computed data to adjust internal state.
pub trait DataControl {
    type Data;

    fn update(&mut self, data: &Self::Data);
}

/// Reports whether the quantity this control watches has converged.
///
/// Line-level implementations must return `false` before the first
/// `update`; surface-level ones may be meaningless until then and report
/// `false` as well.
pub trait ConvergenceControl {
    fn converged(&self) -> bool;
}

/// Produces the sampling options for the next refinement cycle, or `None`
/// once its budget is exhausted. The sequence itself may be infinite; the
/// hard stop comes from a separate capped control.
pub trait IterationControl {
    fn next_options(&mut self) -> Option<RunOptions>;
}

/// Serializable snapshot of a stateful control, one variant per control.
///
/// Restoring a control from its snapshot makes it behaviourally equivalent
/// to the original without replaying any `update` calls, which is what
/// allows a paused run to resume deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlState {
    StepCounter {
        last_num_points: usize,
    },
    IterationCap {
        used: usize,
    },
    PosCheck {
        max_move: Option<f64>,
        last_wcc: Option<Vec<f64>>,
    },
}

/// Exposes and restores a [`ControlState`] snapshot.
pub trait StatefulControl {
    fn state(&self) -> ControlState;

    /// Fails with a configuration error if the snapshot belongs to a
    /// different control.
    fn set_state(&mut self, state: ControlState) -> Result<()>;
}

pub(crate) fn state_mismatch(name: &str) -> Error {
    Error::ControlConfig(format!(
        "persisted state does not belong to control '{name}'"
    ))
}
