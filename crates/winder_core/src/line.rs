//! Adaptive WCC calculation along a single closed k-space loop.
//!
//! The line engine samples the loop with an increasing number of k-points
//! until all line-level convergence controls are satisfied or the iteration
//! budget runs out. Budget exhaustion is not an error: the best-effort
//! result is returned with `converged() == false`.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::control::{
    state_mismatch, ControlLevel, ControlState, ConvergenceControl, DataControl, IterationControl,
    RunOptions, StatefulControl,
};
use crate::error::{Error, Result};
use crate::io::{self, SaveTo, Snapshot};
use crate::system::OverlapSystem;
use crate::wcc::{self, ComplexMatrix};

/// Overlaps with a smaller singular value than this hint at a k-point
/// spacing too coarse for the oracle's states.
const MIN_SINGULAR_WARN: f64 = 0.4;

/// Parametrization of a closed loop in reduced k-space coordinates.
///
/// `kpt(0)` and `kpt(1)` must differ by a reciprocal lattice vector.
pub trait LineDescriptor {
    fn kpt(&self, t: f64) -> [f64; 3];
}

impl<F> LineDescriptor for F
where
    F: Fn(f64) -> [f64; 3],
{
    fn kpt(&self, t: f64) -> [f64; 3] {
        self(t)
    }
}

/// Constant-increment sequence of k-point counts plus a hard iteration cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MeshSettings {
    /// First k-point count. Must be at least 2.
    pub start: usize,
    pub increment: usize,
    /// Maximum number of refinement cycles per line.
    pub max_iter: usize,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            start: 8,
            increment: 2,
            max_iter: 10,
        }
    }
}

/// Settings for a line run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineSettings {
    /// Maximum WCC movement between refinement steps for convergence.
    /// `None` disables the check; a single evaluation is still forced.
    pub pos_tol: Option<f64>,
    pub mesh: MeshSettings,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            pos_tol: Some(1e-2),
            mesh: MeshSettings::default(),
        }
    }
}

/// Produces the k-point count for each refinement cycle.
#[derive(Debug, Clone)]
pub struct StepCounter {
    next_value: usize,
    increment: usize,
    state: usize,
}

impl StepCounter {
    pub fn new(mesh: &MeshSettings) -> Result<Self> {
        if mesh.start < 2 {
            return Err(Error::ControlConfig(
                "mesh start must be at least 2 k-points".into(),
            ));
        }
        if mesh.increment == 0 {
            return Err(Error::ControlConfig("mesh increment must be positive".into()));
        }
        Ok(Self {
            next_value: mesh.start,
            increment: mesh.increment,
            state: 0,
        })
    }
}

impl IterationControl for StepCounter {
    fn next_options(&mut self) -> Option<RunOptions> {
        // skip counts at or below the restored state
        while self.next_value <= self.state {
            self.next_value += self.increment;
        }
        self.state = self.next_value;
        self.next_value += self.increment;
        Some(RunOptions {
            num_points: Some(self.state),
        })
    }
}

impl StatefulControl for StepCounter {
    fn state(&self) -> ControlState {
        ControlState::StepCounter {
            last_num_points: self.state,
        }
    }

    fn set_state(&mut self, state: ControlState) -> Result<()> {
        match state {
            ControlState::StepCounter { last_num_points } => {
                self.state = last_num_points;
                Ok(())
            }
            _ => Err(state_mismatch("StepCounter")),
        }
    }
}

/// Hard ceiling on the number of refinement cycles.
#[derive(Debug, Clone)]
pub struct IterationCap {
    max_iter: usize,
    used: usize,
}

impl IterationCap {
    pub fn new(max_iter: usize) -> Result<Self> {
        if max_iter == 0 {
            return Err(Error::ControlConfig(
                "iteration budget must allow at least one cycle".into(),
            ));
        }
        Ok(Self { max_iter, used: 0 })
    }
}

impl IterationControl for IterationCap {
    fn next_options(&mut self) -> Option<RunOptions> {
        if self.used >= self.max_iter {
            return None;
        }
        self.used += 1;
        Some(RunOptions::default())
    }
}

impl StatefulControl for IterationCap {
    fn state(&self) -> ControlState {
        ControlState::IterationCap { used: self.used }
    }

    fn set_state(&mut self, state: ControlState) -> Result<()> {
        match state {
            ControlState::IterationCap { used } => {
                self.used = used;
                Ok(())
            }
            _ => Err(state_mismatch("IterationCap")),
        }
    }
}

/// Watches the movement of WCC between successive refinement steps.
#[derive(Debug, Clone)]
pub struct PosCheck {
    pos_tol: f64,
    max_move: Option<f64>,
    last_wcc: Option<Vec<f64>>,
}

impl PosCheck {
    pub fn new(pos_tol: f64) -> Result<Self> {
        if !(pos_tol > 0.0 && pos_tol <= 1.0) {
            return Err(Error::ControlConfig(format!(
                "pos_tol must be in (0, 1], got {pos_tol}"
            )));
        }
        Ok(Self {
            pos_tol,
            max_move: None,
            last_wcc: None,
        })
    }

    pub fn max_move(&self) -> Option<f64> {
        self.max_move
    }
}

impl DataControl for PosCheck {
    type Data = LineData;

    fn update(&mut self, data: &LineData) {
        if let Some(last) = &self.last_wcc {
            self.max_move = Some(wcc::max_move(&data.wcc, last));
        }
        self.last_wcc = Some(data.wcc.clone());
    }
}

impl ConvergenceControl for PosCheck {
    fn converged(&self) -> bool {
        self.max_move.is_some_and(|m| m < self.pos_tol)
    }
}

impl StatefulControl for PosCheck {
    fn state(&self) -> ControlState {
        ControlState::PosCheck {
            max_move: self.max_move,
            last_wcc: self.last_wcc.clone(),
        }
    }

    fn set_state(&mut self, state: ControlState) -> Result<()> {
        match state {
            ControlState::PosCheck { max_move, last_wcc } => {
                self.max_move = max_move;
                self.last_wcc = last_wcc;
                Ok(())
            }
            _ => Err(state_mismatch("PosCheck")),
        }
    }
}

/// Forces at least one evaluation when the position check is disabled.
#[derive(Debug, Clone, Default)]
pub struct ForceFirstUpdate {
    updated: bool,
}

impl DataControl for ForceFirstUpdate {
    type Data = LineData;

    fn update(&mut self, _data: &LineData) {
        self.updated = true;
    }
}

impl ConvergenceControl for ForceFirstUpdate {
    fn converged(&self) -> bool {
        self.updated
    }
}

/// Tagged union over the controls applicable to a line run.
#[derive(Debug, Clone)]
pub enum LineCtrl {
    Steps(StepCounter),
    Cap(IterationCap),
    Pos(PosCheck),
    First(ForceFirstUpdate),
}

impl LineCtrl {
    pub fn name(&self) -> &'static str {
        match self {
            LineCtrl::Steps(_) => "StepCounter",
            LineCtrl::Cap(_) => "IterationCap",
            LineCtrl::Pos(_) => "PosCheck",
            LineCtrl::First(_) => "ForceFirstUpdate",
        }
    }

    pub fn level(&self) -> ControlLevel {
        ControlLevel::Line
    }

    fn as_iteration_mut(&mut self) -> Option<&mut dyn IterationControl> {
        match self {
            LineCtrl::Steps(c) => Some(c),
            LineCtrl::Cap(c) => Some(c),
            _ => None,
        }
    }

    fn as_data_mut(&mut self) -> Option<&mut dyn DataControl<Data = LineData>> {
        match self {
            LineCtrl::Pos(c) => Some(c),
            LineCtrl::First(c) => Some(c),
            _ => None,
        }
    }

    fn as_convergence(&self) -> Option<&dyn ConvergenceControl> {
        match self {
            LineCtrl::Pos(c) => Some(c),
            LineCtrl::First(c) => Some(c),
            _ => None,
        }
    }

    fn as_stateful(&self) -> Option<&dyn StatefulControl> {
        match self {
            LineCtrl::Steps(c) => Some(c),
            LineCtrl::Cap(c) => Some(c),
            LineCtrl::Pos(c) => Some(c),
            LineCtrl::First(_) => None,
        }
    }

    fn as_stateful_mut(&mut self) -> Option<&mut dyn StatefulControl> {
        match self {
            LineCtrl::Steps(c) => Some(c),
            LineCtrl::Cap(c) => Some(c),
            LineCtrl::Pos(c) => Some(c),
            LineCtrl::First(_) => None,
        }
    }
}

/// Container grouping line controls by capability.
///
/// Composition is validated once at construction: exactly one step counter,
/// unique control names, and at least one convergence criterion.
#[derive(Debug, Clone)]
pub struct LineControls {
    controls: Vec<LineCtrl>,
}

impl LineControls {
    pub fn new(controls: Vec<LineCtrl>) -> Result<Self> {
        let step_counters = controls
            .iter()
            .filter(|c| matches!(c, LineCtrl::Steps(_)))
            .count();
        if step_counters != 1 {
            return Err(Error::ControlConfig(format!(
                "expected exactly one StepCounter, got {step_counters}"
            )));
        }
        let mut names: Vec<&str> = controls.iter().map(LineCtrl::name).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::ControlConfig(
                "duplicate line controls are not allowed".into(),
            ));
        }
        if !controls.iter().any(|c| c.as_convergence().is_some()) {
            return Err(Error::ControlConfig(
                "at least one convergence control is required".into(),
            ));
        }
        Ok(Self { controls })
    }

    pub fn from_settings(settings: &LineSettings) -> Result<Self> {
        let mut controls = vec![
            LineCtrl::Steps(StepCounter::new(&settings.mesh)?),
            LineCtrl::Cap(IterationCap::new(settings.mesh.max_iter)?),
        ];
        match settings.pos_tol {
            Some(tol) => controls.push(LineCtrl::Pos(PosCheck::new(tol)?)),
            None => controls.push(LineCtrl::First(ForceFirstUpdate::default())),
        }
        Self::new(controls)
    }

    fn next_options(&mut self) -> Option<RunOptions> {
        let mut options = RunOptions::default();
        for ctrl in &mut self.controls {
            if let Some(it) = ctrl.as_iteration_mut() {
                options = options.merge(it.next_options()?);
            }
        }
        Some(options)
    }

    fn update(&mut self, data: &LineData) {
        for ctrl in &mut self.controls {
            if let Some(d) = ctrl.as_data_mut() {
                d.update(data);
            }
        }
    }

    /// Updates data controls that carry no persistent state; stateful ones
    /// are restored from the snapshot instead.
    fn update_nonstateful(&mut self, data: &LineData) {
        for ctrl in &mut self.controls {
            if ctrl.as_stateful().is_none() {
                if let Some(d) = ctrl.as_data_mut() {
                    d.update(data);
                }
            }
        }
    }

    fn converged(&self) -> bool {
        self.controls
            .iter()
            .filter_map(LineCtrl::as_convergence)
            .all(|c| c.converged())
    }

    fn convergence(&self) -> BTreeMap<String, bool> {
        self.controls
            .iter()
            .filter_map(|c| {
                c.as_convergence()
                    .map(|conv| (c.name().to_string(), conv.converged()))
            })
            .collect()
    }

    fn states(&self) -> BTreeMap<String, ControlState> {
        self.controls
            .iter()
            .filter_map(|c| c.as_stateful().map(|s| (c.name().to_string(), s.state())))
            .collect()
    }

    fn restore(&mut self, states: &BTreeMap<String, ControlState>) -> Result<()> {
        for ctrl in &mut self.controls {
            let name = ctrl.name().to_string();
            if let Some(state) = states.get(&name) {
                if let Some(stateful) = ctrl.as_stateful_mut() {
                    stateful.set_state(state.clone())?;
                }
            }
        }
        Ok(())
    }
}

/// Numerical payload of one line evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineData {
    /// Wannier charge centers in [0, 1), sorted ascending.
    pub wcc: Vec<f64>,
    /// Unitarized Wilson loop the WCC were extracted from.
    pub lambda: ComplexMatrix,
    /// Midpoint of the largest WCC-free interval.
    pub gap_pos: f64,
    pub gap_size: f64,
    /// Smallest singular value seen across all overlap factors.
    pub min_singular_value: f64,
    pub num_kpts: usize,
}

impl LineData {
    pub fn from_overlaps(overlaps: &[ComplexMatrix], num_kpts: usize) -> Result<Self> {
        let (lambda, min_singular_value) = wcc::wilson_loop(overlaps)?;
        let wcc_vals = wcc::wcc_from_wilson(&lambda)?;
        let (gap_pos, gap_size) = wcc::gapfind(&wcc_vals);
        Ok(Self {
            wcc: wcc_vals,
            lambda,
            gap_pos,
            gap_size,
            min_singular_value,
            num_kpts,
        })
    }

    /// Total polarization (sum of WCC) along the line, modulo 1.
    pub fn pol(&self) -> f64 {
        self.wcc.iter().sum::<f64>().rem_euclid(1.0)
    }
}

/// Data plus control state and convergence verdicts of one line run.
///
/// Frozen once returned; resuming constructs fresh controls from
/// `ctrl_states` instead of mutating the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineResult {
    pub data: LineData,
    pub ctrl_states: BTreeMap<String, ControlState>,
    pub ctrl_convergence: BTreeMap<String, bool>,
}

impl LineResult {
    fn new(data: LineData, controls: &LineControls) -> Self {
        Self {
            data,
            ctrl_states: controls.states(),
            ctrl_convergence: controls.convergence(),
        }
    }

    pub fn converged(&self) -> bool {
        self.ctrl_convergence.values().all(|&c| c)
    }

    pub fn wcc(&self) -> &[f64] {
        &self.data.wcc
    }

    pub fn gap_pos(&self) -> f64 {
        self.data.gap_pos
    }

    pub fn gap_size(&self) -> f64 {
        self.data.gap_size
    }

    pub fn pol(&self) -> f64 {
        self.data.pol()
    }

    pub fn num_kpts(&self) -> usize {
        self.data.num_kpts
    }

    /// Largest WCC displacement in the last refinement step, if one
    /// happened.
    pub fn max_move(&self) -> Option<f64> {
        match self.ctrl_states.get("PosCheck") {
            Some(ControlState::PosCheck { max_move, .. }) => *max_move,
            _ => None,
        }
    }
}

/// Runs a line calculation with fresh controls and no persistence.
pub fn run_line<S, L>(system: &S, line: &L, settings: &LineSettings) -> Result<LineResult>
where
    S: OverlapSystem + ?Sized,
    L: LineDescriptor + ?Sized,
{
    run_line_with(system, line, settings, None, None)
}

/// Runs a line calculation, optionally resuming from a previous result and
/// persisting each refinement step.
pub fn run_line_with<S, L>(
    system: &S,
    line: &L,
    settings: &LineSettings,
    init_result: Option<&LineResult>,
    save_to: Option<&SaveTo<'_>>,
) -> Result<LineResult>
where
    S: OverlapSystem + ?Sized,
    L: LineDescriptor + ?Sized,
{
    let mut controls = LineControls::from_settings(settings)?;
    run_line_impl(&mut controls, system, line, init_result, save_to)
}

pub(crate) fn run_line_impl<S, L>(
    controls: &mut LineControls,
    system: &S,
    line: &L,
    init_result: Option<&LineResult>,
    save_to: Option<&SaveTo<'_>>,
) -> Result<LineResult>
where
    S: OverlapSystem + ?Sized,
    L: LineDescriptor + ?Sized,
{
    check_closed(line)?;

    let mut result = None;
    if let Some(init) = init_result {
        controls.update_nonstateful(&init.data);
        controls.restore(&init.ctrl_states)?;
        let restored = LineResult::new(init.data.clone(), controls);
        save_line(save_to, &restored)?;
        result = Some(restored);
    }

    loop {
        let convergence = controls.convergence();
        info!(
            "{} of {} line convergence criteria fulfilled",
            convergence.values().filter(|&&c| c).count(),
            convergence.len()
        );
        if result.is_some() && controls.converged() {
            break;
        }

        let Some(options) = controls.next_options() else {
            warn!("iteration budget exhausted before the line converged");
            break;
        };
        let num_points = options.num_points.ok_or_else(|| {
            Error::ControlConfig("no iteration control provided a k-point count".into())
        })?;

        info!("calculating line with N = {num_points} k-points");
        let kpts: Vec<[f64; 3]> = (0..num_points)
            .map(|i| line.kpt(i as f64 / (num_points - 1) as f64))
            .collect();
        let overlaps = system.overlaps(&kpts)?;
        let data = LineData::from_overlaps(&overlaps, num_points)?;
        if data.min_singular_value < MIN_SINGULAR_WARN {
            warn!(
                "smallest overlap singular value {:.3} is below {MIN_SINGULAR_WARN}; \
                 the k-point spacing may be too coarse",
                data.min_singular_value
            );
        }

        controls.update(&data);
        let step_result = LineResult::new(data, controls);
        save_line(save_to, &step_result)?;
        result = Some(step_result);
    }

    result.ok_or_else(|| {
        Error::ControlConfig("line run finished without producing any data".into())
    })
}

fn save_line(save_to: Option<&SaveTo<'_>>, result: &LineResult) -> Result<()> {
    if let Some(dest) = save_to {
        info!("saving line result to {}", dest.path.display());
        io::save(dest.path, dest.codec, &Snapshot::Line(result.clone()))?;
    }
    Ok(())
}

pub(crate) fn check_closed<L: LineDescriptor + ?Sized>(line: &L) -> Result<()> {
    let k0 = line.kpt(0.0);
    let k1 = line.kpt(1.0);
    let delta = [k1[0] - k0[0], k1[1] - k0[1], k1[2] - k0[2]];
    if delta.iter().any(|d| (d - d.round()).abs() > 1e-8) {
        return Err(Error::OpenLoop { delta });
    }
    Ok(())
}
