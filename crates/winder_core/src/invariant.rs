//! Topological invariants extracted from surface WCC data.
//!
//! Both invariants only read the converged WCC/gap traces; how convergence
//! was reached is irrelevant. The `*_checked` variants warn when handed an
//! unconverged result, since the invariant may then be unreliable; they
//! still compute it, because partial results remain scientifically useful.

use log::warn;
use serde::Serialize;

use crate::surface::{SurfaceData, SurfaceResult};
use crate::wcc;

/// Chern number together with its per-line diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ChernResult {
    /// Accumulated polarization winding; an integer up to numerical noise.
    pub chern: f64,
    /// Polarization of each line, in sweep order.
    pub pol: Vec<f64>,
    /// Minimal polarization step between consecutive lines.
    pub steps: Vec<f64>,
}

/// Chern number as the accumulated minimal polarization steps across the
/// sweep.
pub fn chern(data: &SurfaceData) -> ChernResult {
    let pol = data.pol();
    let steps = wcc::pol_step(&pol);
    ChernResult {
        chern: steps.iter().sum(),
        pol,
        steps,
    }
}

/// [`chern`] on a full surface result, warning when it is unconverged.
pub fn chern_checked(result: &SurfaceResult) -> ChernResult {
    if !result.converged() {
        warn!("surface result is not converged; the Chern number may be unreliable");
    }
    chern(&result.data)
}

/// Z2 index as the parity of tracked-gap crossings between neighbouring
/// lines: 0 (trivial) or 1 (topological).
pub fn z2(data: &SurfaceData) -> u8 {
    let wcc_per_line = data.wcc();
    let gaps = data.gap_pos();
    let mut parity = 1_i32;
    for idx in 1..wcc_per_line.len() {
        let gap_left = gaps[idx - 1];
        let gap_right = gaps[idx];
        for &w in &wcc_per_line[idx] {
            parity *= wcc::gap_crossing_sign(gap_left, gap_right, w);
        }
    }
    u8::from(parity == -1)
}

/// [`z2`] on a full surface result, warning when it is unconverged.
pub fn z2_checked(result: &SurfaceResult) -> u8 {
    if !result.converged() {
        warn!("surface result is not converged; the Z2 index may be unreliable");
    }
    z2(&result.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::{LineData, LineResult};
    use crate::surface::{run_surface, SurfaceSettings};
    use crate::system::{HamiltonianSettings, MatrixHamiltonian};
    use crate::wcc::ComplexMatrix;
    use num_complex::Complex;
    use std::collections::BTreeMap;
    use std::f64::consts::{PI, TAU};

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

    fn surface_from_wcc(wcc_per_line: Vec<Vec<f64>>) -> SurfaceData {
        let mut data = SurfaceData::new();
        let count = wcc_per_line.len();
        for (idx, wcc) in wcc_per_line.into_iter().enumerate() {
            let t = idx as f64 / (count - 1).max(1) as f64;
            data.add_line(t, synthetic_line(wcc));
        }
        data
    }

    #[test]
    fn chern_of_static_wcc_is_zero() {
        let data = surface_from_wcc(vec![vec![0.2, 0.6]; 5]);
        let result = chern(&data);
        assert!(result.chern.abs() < 1e-12);
        assert_eq!(result.steps.len(), 4);
        assert!(result.steps.iter().all(|s| s.abs() < 1e-12));
    }

    #[test]
    fn chern_counts_polarization_winding() {
        let data = surface_from_wcc(vec![
            vec![0.0],
            vec![0.25],
            vec![0.5],
            vec![0.75],
            vec![0.0],
        ]);
        let result = chern(&data);
        assert!((result.chern - 1.0).abs() < 1e-12);
        assert_eq!(result.pol.len(), 5);
    }

    #[test]
    fn chern_follows_winding_through_the_branch_cut() {
        let data = surface_from_wcc(vec![vec![0.8], vec![0.95], vec![0.1], vec![0.25]]);
        let result = chern(&data);
        // net displacement +0.45, no spurious integer jumps
        assert!((result.chern - 0.45).abs() < 1e-12);
    }

    #[test]
    fn z2_is_trivial_for_static_wcc() {
        let data = surface_from_wcc(vec![vec![0.3]; 4]);
        assert_eq!(z2(&data), 0);
    }

    #[test]
    fn z2_detects_a_single_gap_crossing() {
        // the gap jumps from 0.8 to 0.1 while a WCC sits at 0.6, strictly
        // between the two gap positions
        let data = surface_from_wcc(vec![vec![0.3], vec![0.6]]);
        assert_eq!(z2(&data), 1);
    }

    #[test]
    fn weyl_point_on_a_sphere_carries_unit_chern_number() {
        let system = weyl_system();
        let result = run_surface(&system, &sphere, &SurfaceSettings::default())
            .expect("surface runs");
        assert!(result.converged());
        let invariant = chern_checked(&result);
        assert!(
            (invariant.chern.abs() - 1.0).abs() < 1e-6,
            "expected |chern| = 1, got {}",
            invariant.chern
        );
        assert_eq!(invariant.steps.len(), result.data.lines().len() - 1);
    }

    #[test]
    fn reversing_the_sphere_orientation_flips_the_chern_sign() {
        let system = weyl_system();
        let forward = run_surface(&system, &sphere, &SurfaceSettings::default())
            .expect("surface runs");
        let reversed_sphere = |t: f64, s: f64| sphere(t, 1.0 - s);
        let reversed = run_surface(&system, &reversed_sphere, &SurfaceSettings::default())
            .expect("surface runs");
        let c_forward = chern(&forward.data).chern;
        let c_reversed = chern(&reversed.data).chern;
        assert!(
            (c_forward + c_reversed).abs() < 1e-6,
            "expected opposite signs, got {c_forward} and {c_reversed}"
        );
    }

    #[test]
    fn bhz_model_z2_distinguishes_inverted_from_trivial() {
        // half-BZ sweep: lines along kx, ky from 0 to 1/2
        let half_bz = |t: f64, s: f64| [s, 0.5 * t, 0.0];

        let inverted = MatrixHamiltonian::new(bhz(1.0), HamiltonianSettings::default())
            .expect("construction");
        let result =
            run_surface(&inverted, &half_bz, &SurfaceSettings::default()).expect("surface runs");
        assert!(result.converged());
        assert_eq!(z2_checked(&result), 1);

        let trivial = MatrixHamiltonian::new(bhz(-1.0), HamiltonianSettings::default())
            .expect("construction");
        let result =
            run_surface(&trivial, &half_bz, &SurfaceSettings::default()).expect("surface runs");
        assert!(result.converged());
        assert_eq!(z2_checked(&result), 0);
    }

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

    /// Lattice-regularized BHZ Hamiltonian: spin-up block `d(k) . sigma`
    /// with `d = (sin kx, sin ky, m - 2(2 - cos kx - cos ky))`, spin-down
    /// block its time reversal.
    fn bhz(m: f64) -> impl Fn([f64; 3]) -> ComplexMatrix {
        move |k: [f64; 3]| {
            let kx = TAU * k[0];
            let ky = TAU * k[1];
            let d1 = kx.sin();
            let d2 = ky.sin();
            let d3 = m - 2.0 * (2.0 - kx.cos() - ky.cos());
            let zero = Complex::new(0.0, 0.0);
            ComplexMatrix::from_row_slice(
                4,
                4,
                &[
                    Complex::new(d3, 0.0),
                    Complex::new(d1, -d2),
                    zero,
                    zero,
                    Complex::new(d1, d2),
                    Complex::new(-d3, 0.0),
                    zero,
                    zero,
                    zero,
                    zero,
                    Complex::new(d3, 0.0),
                    Complex::new(-d1, -d2),
                    zero,
                    zero,
                    Complex::new(-d1, d2),
                    Complex::new(-d3, 0.0),
                ],
            )
        }
    }
}
