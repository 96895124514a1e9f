//! Adaptive WCC sweep over a one-parameter family of closed k-space loops.
//!
//! The surface engine evaluates the line engine at a growing set of sweep
//! positions t, pairs WCC branches between neighbouring lines, and bisects
//! every interval whose pair checks fail (leftmost first) until all
//! surface-level controls are satisfied, the minimum neighbour distance
//! blocks further insertions, or a refinement round adds no line. The
//! growing result is persisted after every accepted line so a killed run
//! resumes without repeating oracle calls.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::control::{ControlLevel, ControlState, ConvergenceControl, DataControl};
use crate::error::{Error, Result};
use crate::io::{self, SaveTo, Snapshot};
use crate::line::{run_line_impl, LineControls, LineResult, LineSettings};
use crate::system::OverlapSystem;
use crate::wcc;

/// Parametrization of a surface in reduced k-space coordinates.
///
/// `t` selects the line, `s` runs along it; for every fixed `t` the map
/// `s -> kpt(t, s)` must be a closed loop.
pub trait SurfaceDescriptor {
    fn kpt(&self, t: f64, s: f64) -> [f64; 3];
}

impl<F> SurfaceDescriptor for F
where
    F: Fn(f64, f64) -> [f64; 3],
{
    fn kpt(&self, t: f64, s: f64) -> [f64; 3] {
        self(t, s)
    }
}

/// Settings for a surface run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SurfaceSettings {
    pub line: LineSettings,
    /// Neighbouring WCC must keep this fraction of the gap size away from
    /// the gap position for crossings to be assignable. `None` disables.
    pub gap_tol: Option<f64>,
    /// Paired WCC movement between neighbouring lines, as a fraction of the
    /// smaller gap size. `None` disables.
    pub move_tol: Option<f64>,
    /// Number of lines in the initial sweep (endpoints included).
    pub num_lines: usize,
    /// No line is inserted closer than this to an existing one.
    pub min_neighbour_dist: f64,
}

impl Default for SurfaceSettings {
    fn default() -> Self {
        Self {
            line: LineSettings::default(),
            gap_tol: Some(0.3),
            move_tol: Some(0.3),
            num_lines: 11,
            min_neighbour_dist: 0.01,
        }
    }
}

/// Checks that paired WCC of neighbouring lines have not moved too much
/// relative to the smaller of the two gaps.
#[derive(Debug, Clone)]
pub struct MoveCheck {
    move_tol: f64,
    converged: Option<Vec<bool>>,
}

impl MoveCheck {
    pub fn new(move_tol: f64) -> Result<Self> {
        if move_tol <= 0.0 {
            return Err(Error::ControlConfig(format!(
                "move_tol must be positive, got {move_tol}"
            )));
        }
        Ok(Self {
            move_tol,
            converged: None,
        })
    }

    /// Per neighbouring pair; `None` before the first update.
    pub fn pairs(&self) -> Option<&[bool]> {
        self.converged.as_deref()
    }
}

impl DataControl for MoveCheck {
    type Data = SurfaceData;

    fn update(&mut self, data: &SurfaceData) {
        self.converged = Some(
            data.lines()
                .windows(2)
                .map(|pair| {
                    let (left, right) = (&pair[0].result, &pair[1].result);
                    wcc::max_move(left.wcc(), right.wcc())
                        < self.move_tol * left.gap_size().min(right.gap_size())
                })
                .collect(),
        );
    }
}

impl ConvergenceControl for MoveCheck {
    fn converged(&self) -> bool {
        self.converged
            .as_ref()
            .is_some_and(|pairs| pairs.iter().all(|&c| c))
    }
}

/// Checks that the largest gap of each line stays clear of the WCC of its
/// neighbours, measured on the periodic interval.
#[derive(Debug, Clone)]
pub struct GapCheck {
    gap_tol: f64,
    converged: Option<Vec<bool>>,
}

impl GapCheck {
    pub fn new(gap_tol: f64) -> Result<Self> {
        if gap_tol <= 0.0 {
            return Err(Error::ControlConfig(format!(
                "gap_tol must be positive, got {gap_tol}"
            )));
        }
        Ok(Self {
            gap_tol,
            converged: None,
        })
    }

    pub fn pairs(&self) -> Option<&[bool]> {
        self.converged.as_deref()
    }
}

impl DataControl for GapCheck {
    type Data = SurfaceData;

    fn update(&mut self, data: &SurfaceData) {
        self.converged = Some(
            data.lines()
                .windows(2)
                .map(|pair| {
                    let (left, right) = (&pair[0].result, &pair[1].result);
                    let clear = |line: &LineResult, other: &LineResult| {
                        other.wcc().iter().all(|&w| {
                            wcc::periodic_dist(w, line.gap_pos())
                                > self.gap_tol * line.gap_size()
                        })
                    };
                    clear(left, right) && clear(right, left)
                })
                .collect(),
        );
    }
}

impl ConvergenceControl for GapCheck {
    fn converged(&self) -> bool {
        self.converged
            .as_ref()
            .is_some_and(|pairs| pairs.iter().all(|&c| c))
    }
}

/// Tagged union over the surface-level controls.
#[derive(Debug, Clone)]
pub enum SurfaceCtrl {
    Move(MoveCheck),
    Gap(GapCheck),
}

impl SurfaceCtrl {
    pub fn name(&self) -> &'static str {
        match self {
            SurfaceCtrl::Move(_) => "MoveCheck",
            SurfaceCtrl::Gap(_) => "GapCheck",
        }
    }

    pub fn level(&self) -> ControlLevel {
        ControlLevel::Surface
    }

    fn pairs(&self) -> Option<&[bool]> {
        match self {
            SurfaceCtrl::Move(c) => c.pairs(),
            SurfaceCtrl::Gap(c) => c.pairs(),
        }
    }

    fn update(&mut self, data: &SurfaceData) {
        match self {
            SurfaceCtrl::Move(c) => c.update(data),
            SurfaceCtrl::Gap(c) => c.update(data),
        }
    }
}

/// Container grouping the line-control prototype (cloned for every line
/// evaluation) and the surface-level controls.
#[derive(Debug, Clone)]
pub struct SurfaceControls {
    line_proto: LineControls,
    controls: Vec<SurfaceCtrl>,
}

impl SurfaceControls {
    pub fn new(line_proto: LineControls, controls: Vec<SurfaceCtrl>) -> Result<Self> {
        let mut names: Vec<&str> = controls.iter().map(SurfaceCtrl::name).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::ControlConfig(
                "duplicate surface controls are not allowed".into(),
            ));
        }
        Ok(Self {
            line_proto,
            controls,
        })
    }

    pub fn from_settings(settings: &SurfaceSettings) -> Result<Self> {
        let mut controls = Vec::new();
        if let Some(tol) = settings.move_tol {
            controls.push(SurfaceCtrl::Move(MoveCheck::new(tol)?));
        }
        if let Some(tol) = settings.gap_tol {
            controls.push(SurfaceCtrl::Gap(GapCheck::new(tol)?));
        }
        Self::new(LineControls::from_settings(&settings.line)?, controls)
    }

    /// Fresh line controls for one line evaluation.
    fn line_controls(&self) -> LineControls {
        self.line_proto.clone()
    }

    fn update(&mut self, data: &SurfaceData) {
        for ctrl in &mut self.controls {
            ctrl.update(data);
        }
    }

    /// Elementwise AND of the per-pair verdicts of all surface controls.
    /// A control that has never been updated vetoes every pair.
    fn collect_convergence(&self, num_pairs: usize) -> Vec<bool> {
        let mut verdict = vec![true; num_pairs];
        for ctrl in &self.controls {
            match ctrl.pairs() {
                Some(pairs) => {
                    for (v, &p) in verdict.iter_mut().zip(pairs.iter()) {
                        *v = *v && p;
                    }
                }
                None => verdict.iter_mut().for_each(|v| *v = false),
            }
        }
        verdict
    }

    fn states(&self) -> BTreeMap<String, ControlState> {
        // no surface control carries persistent state today; the map is
        // kept so results stay forward compatible
        BTreeMap::new()
    }

    fn convergence(&self) -> BTreeMap<String, Option<Vec<bool>>> {
        self.controls
            .iter()
            .map(|c| (c.name().to_string(), c.pairs().map(<[bool]>::to_vec)))
            .collect()
    }

    fn restore(&mut self, _states: &BTreeMap<String, ControlState>) -> Result<()> {
        Ok(())
    }
}

/// One line of the surface: its sweep position and result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceLine {
    pub t: f64,
    pub result: LineResult,
}

/// All computed lines of a surface, kept sorted by sweep position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfaceData {
    lines: Vec<SurfaceLine>,
}

impl SurfaceData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a line, keeping the t-ordering.
    pub fn add_line(&mut self, t: f64, result: LineResult) {
        let idx = self.lines.partition_point(|line| line.t < t);
        self.lines.insert(idx, SurfaceLine { t, result });
    }

    pub(crate) fn set_result(&mut self, idx: usize, result: LineResult) {
        self.lines[idx].result = result;
    }

    pub fn lines(&self) -> &[SurfaceLine] {
        &self.lines
    }

    pub fn t(&self) -> Vec<f64> {
        self.lines.iter().map(|line| line.t).collect()
    }

    pub fn wcc(&self) -> Vec<Vec<f64>> {
        self.lines
            .iter()
            .map(|line| line.result.wcc().to_vec())
            .collect()
    }

    pub fn pol(&self) -> Vec<f64> {
        self.lines.iter().map(|line| line.result.pol()).collect()
    }

    pub fn gap_pos(&self) -> Vec<f64> {
        self.lines.iter().map(|line| line.result.gap_pos()).collect()
    }

    pub fn gap_size(&self) -> Vec<f64> {
        self.lines
            .iter()
            .map(|line| line.result.gap_size())
            .collect()
    }

    /// Distance from `t` to the nearest existing line; 1 when empty.
    pub fn nearest_neighbour_dist(&self, t: f64) -> f64 {
        self.lines
            .iter()
            .map(|line| (line.t - t).abs())
            .fold(1.0, f64::min)
    }
}

/// Data plus control state and per-pair convergence verdicts of a surface
/// run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceResult {
    pub data: SurfaceData,
    pub ctrl_states: BTreeMap<String, ControlState>,
    /// Per surface control: one verdict per neighbouring line pair, `None`
    /// if the control was never evaluated.
    pub ctrl_convergence: BTreeMap<String, Option<Vec<bool>>>,
}

impl SurfaceResult {
    fn new(data: SurfaceData, controls: &SurfaceControls) -> Self {
        Self {
            data,
            ctrl_states: controls.states(),
            ctrl_convergence: controls.convergence(),
        }
    }

    /// True when every surface pair check passed and every line converged.
    pub fn converged(&self) -> bool {
        let lines_ok = self
            .data
            .lines()
            .iter()
            .all(|line| line.result.converged());
        let pairs_ok = self.ctrl_convergence.values().all(|pairs| {
            pairs
                .as_ref()
                .is_some_and(|p| p.iter().all(|&c| c))
        });
        lines_ok && pairs_ok
    }

    pub fn convergence_report(&self) -> ConvergenceReport {
        let mut line_checks: BTreeMap<String, LineCheckReport> = BTreeMap::new();
        for line in self.data.lines() {
            for (name, &passed) in &line.result.ctrl_convergence {
                let entry = line_checks.entry(name.clone()).or_default();
                if passed {
                    entry.passed.push(line.t);
                } else {
                    entry.failed.push(line.t);
                }
            }
        }
        // lines missing a check that others report
        for line in self.data.lines() {
            for (name, entry) in line_checks.iter_mut() {
                if !line.result.ctrl_convergence.contains_key(name) {
                    entry.missing.push(line.t);
                }
            }
        }

        let t_vals = self.data.t();
        let surface_checks = self
            .ctrl_convergence
            .iter()
            .map(|(name, pairs)| {
                let report = pairs.as_ref().map(|pairs| {
                    let mut report = PairCheckReport::default();
                    for (window, &passed) in t_vals.windows(2).zip(pairs.iter()) {
                        let interval = (window[0], window[1]);
                        if passed {
                            report.passed.push(interval);
                        } else {
                            report.failed.push(interval);
                        }
                    }
                    report
                });
                (name.clone(), report)
            })
            .collect();

        ConvergenceReport {
            line: line_checks,
            surface: surface_checks,
        }
    }
}

/// Which convergence checks passed where, grouped by control.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    pub line: BTreeMap<String, LineCheckReport>,
    pub surface: BTreeMap<String, Option<PairCheckReport>>,
}

/// Sweep positions at which a line-level check passed, failed, or was never
/// performed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LineCheckReport {
    pub passed: Vec<f64>,
    pub failed: Vec<f64>,
    pub missing: Vec<f64>,
}

/// Neighbouring t-intervals for which a surface-level check passed or
/// failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PairCheckReport {
    pub passed: Vec<(f64, f64)>,
    pub failed: Vec<(f64, f64)>,
}

/// Runs a surface calculation with fresh controls and no persistence.
pub fn run_surface<S, D>(
    system: &S,
    surface: &D,
    settings: &SurfaceSettings,
) -> Result<SurfaceResult>
where
    S: OverlapSystem + ?Sized,
    D: SurfaceDescriptor + ?Sized,
{
    run_surface_with(system, surface, settings, None, None)
}

/// Runs a surface calculation, optionally resuming from a previous result
/// and persisting after every accepted line.
pub fn run_surface_with<S, D>(
    system: &S,
    surface: &D,
    settings: &SurfaceSettings,
    init_result: Option<&SurfaceResult>,
    save_to: Option<&SaveTo<'_>>,
) -> Result<SurfaceResult>
where
    S: OverlapSystem + ?Sized,
    D: SurfaceDescriptor + ?Sized,
{
    if settings.num_lines < 2 {
        return Err(Error::ControlConfig(format!(
            "num_lines must be at least 2, got {}",
            settings.num_lines
        )));
    }
    if !(0.0..1.0).contains(&settings.min_neighbour_dist) {
        return Err(Error::ControlConfig(format!(
            "min_neighbour_dist must be in [0, 1), got {}",
            settings.min_neighbour_dist
        )));
    }

    let mut controls = SurfaceControls::from_settings(settings)?;
    let mut data = SurfaceData::new();
    let mut result = None;

    if let Some(init) = init_result {
        info!("initializing from an existing surface result");
        controls.restore(&init.ctrl_states)?;
        data = init.data.clone();
        for idx in 0..data.lines().len() {
            let t = data.lines()[idx].t;
            info!("re-running line at t = {t}");
            let previous = data.lines()[idx].result.clone();
            let rerun = run_stored_line(&controls, system, surface, t, Some(&previous))?;
            data.set_result(idx, rerun);
            result = Some(update_and_save(&data, &mut controls, save_to)?);
        }
    }

    info!("adding the {} initial lines", settings.num_lines);
    for i in 0..settings.num_lines {
        let t = i as f64 / (settings.num_lines - 1) as f64;
        if let Some(r) = add_line(&mut data, &mut controls, system, surface, t, settings, save_to)? {
            result = Some(r);
        }
    }

    let mut num_lines = data.lines().len();
    let mut verdict = collect_convergence(&controls, &data);
    while !verdict.iter().all(|&c| c) {
        let t_vals = data.t();
        let new_t: Vec<f64> = t_vals
            .windows(2)
            .zip(verdict.iter())
            .filter(|(_, &converged)| !converged)
            .map(|(window, _)| (window[0] + window[1]) / 2.0)
            .collect();
        for t in new_t {
            if let Some(r) =
                add_line(&mut data, &mut controls, system, surface, t, settings, save_to)?
            {
                result = Some(r);
            }
        }

        let grown = data.lines().len();
        if grown == num_lines {
            warn!("surface refinement stalled; returning the unconverged result");
            break;
        }
        num_lines = grown;
        verdict = collect_convergence(&controls, &data);
    }

    result.ok_or_else(|| {
        Error::ControlConfig("surface run finished without producing any data".into())
    })
}

fn run_stored_line<S, D>(
    controls: &SurfaceControls,
    system: &S,
    surface: &D,
    t: f64,
    init: Option<&LineResult>,
) -> Result<LineResult>
where
    S: OverlapSystem + ?Sized,
    D: SurfaceDescriptor + ?Sized,
{
    let mut line_controls = controls.line_controls();
    let line = |s: f64| surface.kpt(t, s);
    run_line_impl(&mut line_controls, system, &line, init, None)
}

/// Adds a line at `t` unless it would violate the minimum neighbour
/// distance; returns the updated result when a line was accepted.
fn add_line<S, D>(
    data: &mut SurfaceData,
    controls: &mut SurfaceControls,
    system: &S,
    surface: &D,
    t: f64,
    settings: &SurfaceSettings,
    save_to: Option<&SaveTo<'_>>,
) -> Result<Option<SurfaceResult>>
where
    S: OverlapSystem + ?Sized,
    D: SurfaceDescriptor + ?Sized,
{
    let dist = data.nearest_neighbour_dist(t);
    if dist < settings.min_neighbour_dist {
        if dist == 0.0 {
            info!("line at t = {t} exists already");
        } else {
            warn!("minimum neighbour distance reached: cannot add line at t = {t}");
        }
        return Ok(None);
    }

    info!("adding line at t = {t}");
    let result = run_stored_line(controls, system, surface, t, None)?;
    data.add_line(t, result);
    update_and_save(data, controls, save_to).map(Some)
}

fn update_and_save(
    data: &SurfaceData,
    controls: &mut SurfaceControls,
    save_to: Option<&SaveTo<'_>>,
) -> Result<SurfaceResult> {
    controls.update(data);
    let result = SurfaceResult::new(data.clone(), controls);
    if let Some(dest) = save_to {
        info!("saving surface result to {}", dest.path.display());
        io::save(dest.path, dest.codec, &Snapshot::Surface(result.clone()))?;
    }
    Ok(result)
}

fn collect_convergence(controls: &SurfaceControls, data: &SurfaceData) -> Vec<bool> {
    let num_pairs = data.lines().len().saturating_sub(1);
    let verdict = controls.collect_convergence(num_pairs);
    info!(
        "convergence criteria fulfilled for {} of {} neighbouring line pairs",
        verdict.iter().filter(|&&c| c).count(),
        verdict.len()
    );
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlLevel;
    use crate::line::{LineData, MeshSettings};
    use crate::system::{HamiltonianSettings, MatrixHamiltonian};
    use crate::wcc::ComplexMatrix;
    use num_complex::Complex;
    use std::f64::consts::{PI, TAU};

    fn weyl_system() -> MatrixHamiltonian<impl Fn([f64; 3]) -> ComplexMatrix> {
        MatrixHamiltonian::new(
            |k: [f64; 3]| {
                ComplexMatrix::from_row_slice(
                    2,
                    2,
                    &[
                        Complex::new(k[2], 0.0),
                        Complex::new(k[0], -k[1]),
                        Complex::new(k[0], k[1]),
                        Complex::new(-k[2], 0.0),
                    ],
                )
            },
            HamiltonianSettings::default(),
        )
        .expect("construction")
    }

    fn sphere(t: f64, s: f64) -> [f64; 3] {
        let theta = PI * t;
        let phi = TAU * s;
        [
            theta.sin() * phi.cos(),
            theta.sin() * phi.sin(),
            -theta.cos(),
        ]
    }

    fn synthetic_line(wcc: Vec<f64>) -> LineResult {
        let n = wcc.len();
        let (gap_pos, gap_size) = crate::wcc::gapfind(&wcc);
        LineResult {
            data: LineData {
                wcc,
                lambda: ComplexMatrix::identity(n, n),
                gap_pos,
                gap_size,
                min_singular_value: 1.0,
                num_kpts: 0,
            },
            ctrl_states: BTreeMap::new(),
            ctrl_convergence: BTreeMap::new(),
        }
    }

    #[test]
    fn surface_data_keeps_lines_sorted_by_t() {
        let mut data = SurfaceData::new();
        data.add_line(0.5, synthetic_line(vec![0.1]));
        data.add_line(0.25, synthetic_line(vec![0.2]));
        data.add_line(0.75, synthetic_line(vec![0.3]));
        assert_eq!(data.t(), vec![0.25, 0.5, 0.75]);
        assert_eq!(data.wcc()[0], vec![0.2]);
    }

    #[test]
    fn nearest_neighbour_dist_defaults_to_one_when_empty() {
        let data = SurfaceData::new();
        assert!((data.nearest_neighbour_dist(0.3) - 1.0).abs() < 1e-12);
        let mut data = SurfaceData::new();
        data.add_line(0.5, synthetic_line(vec![0.1]));
        assert!((data.nearest_neighbour_dist(0.3) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn move_check_flags_large_paired_movement() {
        let mut data = SurfaceData::new();
        data.add_line(0.0, synthetic_line(vec![0.0]));
        data.add_line(1.0, synthetic_line(vec![0.4]));
        let mut check = MoveCheck::new(0.3).expect("valid tolerance");
        assert!(!check.converged());
        check.update(&data);
        assert_eq!(check.pairs(), Some(&[false][..]));

        let mut data = SurfaceData::new();
        data.add_line(0.0, synthetic_line(vec![0.0]));
        data.add_line(1.0, synthetic_line(vec![0.01]));
        check.update(&data);
        assert_eq!(check.pairs(), Some(&[true][..]));
        assert!(check.converged());
    }

    #[test]
    fn gap_check_flags_wcc_near_the_neighbouring_gap() {
        // line gaps sit at 0.55 (size 0.7); a neighbour WCC at 0.5 is well
        // inside the tolerance zone of 0.3 * 0.7
        let mut data = SurfaceData::new();
        data.add_line(0.0, synthetic_line(vec![0.1, 0.2, 0.9]));
        data.add_line(1.0, synthetic_line(vec![0.5]));
        let mut check = GapCheck::new(0.3).expect("valid tolerance");
        check.update(&data);
        assert_eq!(check.pairs(), Some(&[false][..]));

        let mut data = SurfaceData::new();
        data.add_line(0.0, synthetic_line(vec![0.1, 0.2, 0.9]));
        data.add_line(1.0, synthetic_line(vec![0.11, 0.21, 0.91]));
        check.update(&data);
        assert_eq!(check.pairs(), Some(&[true][..]));
    }

    #[test]
    fn surface_controls_report_their_level() {
        let check = SurfaceCtrl::Move(MoveCheck::new(0.3).expect("valid tolerance"));
        assert_eq!(check.level(), ControlLevel::Surface);
    }

    #[test]
    fn duplicate_surface_controls_are_rejected() {
        let line_proto = LineControls::from_settings(&LineSettings::default()).expect("controls");
        let err = SurfaceControls::new(
            line_proto,
            vec![
                SurfaceCtrl::Gap(GapCheck::new(0.3).expect("valid")),
                SurfaceCtrl::Gap(GapCheck::new(0.2).expect("valid")),
            ],
        )
        .map(|_| ())
        .expect_err("must reject");
        assert!(matches!(err, Error::ControlConfig(_)));
    }

    #[test]
    fn weyl_sphere_sweep_converges_with_default_settings() {
        let system = weyl_system();
        let result =
            run_surface(&system, &sphere, &SurfaceSettings::default()).expect("surface runs");
        assert!(result.converged());
        assert!(result.data.lines().len() >= 11);
        for line in result.data.lines() {
            assert!(line.result.converged());
            assert!(line.result.wcc().iter().all(|&w| (0.0..1.0).contains(&w)));
        }
        // lines stay sorted through refinement
        let t = result.data.t();
        assert!(t.windows(2).all(|w| w[0] < w[1]));

        let report = result.convergence_report();
        assert!(report.line["PosCheck"].failed.is_empty());
        for pairs in report.surface.values() {
            let pairs = pairs.as_ref().expect("checks evaluated");
            assert!(pairs.failed.is_empty());
        }
    }

    #[test]
    fn coarse_initial_sweep_is_refined_by_bisection() {
        let system = weyl_system();
        let settings = SurfaceSettings {
            num_lines: 3,
            ..SurfaceSettings::default()
        };
        let result = run_surface(&system, &sphere, &settings).expect("surface runs");
        assert!(result.converged());
        assert!(result.data.lines().len() > 3);
    }

    #[test]
    fn blocked_refinement_returns_an_unconverged_result() {
        let system = weyl_system();
        let settings = SurfaceSettings {
            num_lines: 3,
            min_neighbour_dist: 0.3,
            ..SurfaceSettings::default()
        };
        let result = run_surface(&system, &sphere, &settings).expect("surface still runs");
        assert!(!result.converged());
        assert_eq!(result.data.lines().len(), 3);
    }

    #[test]
    fn resuming_a_converged_surface_repeats_no_oracle_calls() {
        struct Counting<S> {
            inner: S,
            calls: std::cell::Cell<usize>,
        }
        impl<S: OverlapSystem> OverlapSystem for Counting<S> {
            fn overlaps(&self, kpts: &[[f64; 3]]) -> Result<Vec<ComplexMatrix>> {
                self.calls.set(self.calls.get() + 1);
                self.inner.overlaps(kpts)
            }
        }

        let system = Counting {
            inner: weyl_system(),
            calls: std::cell::Cell::new(0),
        };
        let settings = SurfaceSettings::default();
        let first = run_surface(&system, &sphere, &settings).expect("surface runs");
        assert!(first.converged());
        let calls_before = system.calls.get();

        let resumed = run_surface_with(&system, &sphere, &settings, Some(&first), None)
            .expect("resume runs");
        assert_eq!(system.calls.get(), calls_before);
        assert!(resumed.converged());
        assert_eq!(resumed.data.t(), first.data.t());
        assert_eq!(resumed.data.wcc(), first.data.wcc());
    }

    #[test]
    fn surface_snapshots_survive_a_disk_roundtrip() {
        let system = weyl_system();
        let path = std::env::temp_dir().join(format!(
            "winder-{}-surface-roundtrip.json",
            std::process::id()
        ));
        let save_to = SaveTo::new(&path);
        let settings = SurfaceSettings::default();
        let original = run_surface_with(&system, &sphere, &settings, None, Some(&save_to))
            .expect("surface runs");

        let loaded = io::load(&path, io::default_codec())
            .expect("snapshot loads")
            .into_surface()
            .expect("surface snapshot");
        assert_eq!(loaded.data.t(), original.data.t());
        assert_eq!(loaded.data.wcc(), original.data.wcc());
        assert_eq!(loaded.converged(), original.converged());

        // restarting from the snapshot must change nothing
        let resumed = run_surface_with(&system, &sphere, &settings, Some(&loaded), None)
            .expect("resume runs");
        assert_eq!(resumed.data.t(), original.data.t());
        assert_eq!(resumed.data.wcc(), original.data.wcc());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn mesh_budget_exhaustion_leaves_surface_unconverged_but_usable() {
        let system = weyl_system();
        let settings = SurfaceSettings {
            line: LineSettings {
                mesh: MeshSettings {
                    max_iter: 1,
                    ..MeshSettings::default()
                },
                ..LineSettings::default()
            },
            ..SurfaceSettings::default()
        };
        let result = run_surface(&system, &sphere, &settings).expect("surface still runs");
        // every line stopped after one cycle, so no line can report pos_tol
        assert!(!result.converged());
        assert!(result
            .data
            .lines()
            .iter()
            .all(|line| !line.result.converged()));
    }
}
