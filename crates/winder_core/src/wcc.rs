//! Numerics for Wannier charge center extraction and comparison.
//!
//! A WCC vector holds the eigenphases of the unitarized Wilson loop (the
//! accumulated product of overlap matrices along a closed k-loop), scaled to
//! reduced coordinates in [0, 1). Everything downstream of the oracle lives
//! here: SVD regularization, gap finding on the unit circle, and the periodic
//! pairing used to measure movement between WCC sets.

use std::f64::consts::TAU;

use nalgebra::linalg::SVD;
use nalgebra::DMatrix;
use num_complex::Complex;

use crate::error::{Error, Result};

/// Dense complex matrix, the common currency of the oracle interface.
pub type ComplexMatrix = DMatrix<Complex<f64>>;

/// Unitary factor of `m` via SVD, together with its smallest singular value.
///
/// Physical overlap matrices are not exactly unitary due to finite-basis
/// truncation; discarding the singular values restores unitarity before
/// eigenphases are taken.
pub fn unitary_part(m: &ComplexMatrix) -> Result<(ComplexMatrix, f64)> {
    if m.nrows() == 0 {
        return Ok((m.clone(), 1.0));
    }
    let svd = SVD::new(m.clone(), true, true);
    let u = svd
        .u
        .ok_or_else(|| Error::Numerical("SVD did not produce a left factor".into()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::Numerical("SVD did not produce a right factor".into()))?;
    let min_sv = svd
        .singular_values
        .iter()
        .fold(f64::INFINITY, |acc, &s| acc.min(s));
    Ok((u * v_t, min_sv))
}

/// Ordered product of the unitarized overlap matrices, with the minimum
/// singular value encountered across all factors.
///
/// A small minimum singular value means neighbouring k-points are too far
/// apart for the overlaps to be meaningful.
pub fn wilson_loop(overlaps: &[ComplexMatrix]) -> Result<(ComplexMatrix, f64)> {
    let dim = overlaps.first().map_or(0, |m| m.nrows());
    let mut lambda = ComplexMatrix::identity(dim, dim);
    let mut min_sv = 1.0_f64;
    for m in overlaps {
        if m.nrows() != dim || m.ncols() != dim {
            return Err(Error::Numerical(format!(
                "overlap matrix is {}x{}, expected {}x{}",
                m.nrows(),
                m.ncols(),
                dim,
                dim
            )));
        }
        let (u, sv) = unitary_part(m)?;
        lambda = lambda * u;
        min_sv = min_sv.min(sv);
    }
    Ok((lambda, min_sv))
}

/// WCC as the sorted eigenphases of the Wilson loop, scaled to [0, 1).
///
/// An empty matrix (zero occupied states) yields an empty WCC vector.
pub fn wcc_from_wilson(lambda: &ComplexMatrix) -> Result<Vec<f64>> {
    if lambda.nrows() == 0 {
        return Ok(Vec::new());
    }
    let eigs = lambda.eigenvalues().ok_or_else(|| {
        Error::Numerical("eigenvalue iteration did not converge for the Wilson loop".into())
    })?;
    let mut wcc: Vec<f64> = eigs
        .iter()
        .map(|z| (z.arg() / TAU).rem_euclid(1.0))
        .collect();
    wcc.sort_by(f64::total_cmp);
    Ok(wcc)
}

/// Largest WCC-free interval modulo 1: (midpoint position, size).
///
/// The wrap-around interval is handled explicitly so that a gap size of 1
/// (a single WCC, or none at all) is reachable.
pub fn gapfind(wcc: &[f64]) -> (f64, f64) {
    if wcc.is_empty() {
        return (0.5, 1.0);
    }
    let mut sorted = wcc.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut gap_size = 0.0;
    let mut gap_idx = 0;
    for i in 0..sorted.len() - 1 {
        let gap = sorted[i + 1] - sorted[i];
        if gap > gap_size {
            gap_size = gap;
            gap_idx = i;
        }
    }
    let wrap = sorted[0] - sorted[sorted.len() - 1] + 1.0;
    if wrap > gap_size {
        gap_size = wrap;
        gap_idx = sorted.len() - 1;
    }
    (
        (sorted[gap_idx] + gap_size / 2.0).rem_euclid(1.0),
        gap_size,
    )
}

/// Smallest distance between `x` and `y` on the periodic interval [0, 1).
pub fn periodic_dist(x: f64, y: f64) -> f64 {
    let x = x.rem_euclid(1.0);
    let y = y.rem_euclid(1.0);
    ((1.0 + x - y).rem_euclid(1.0)).min((1.0 - x + y).rem_euclid(1.0))
}

/// Largest displacement between two WCC sets under periodic pairing.
///
/// Both sets are shifted so the largest gap of their union sits at the
/// branch cut, then matched index-wise after sorting. Identical inputs give
/// zero; the returned order of either set is irrelevant.
pub fn max_move(a: &[f64], b: &[f64]) -> f64 {
    let union: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
    let (gap_pos, _) = gapfind(&union);
    let shifted = |vals: &[f64]| -> Vec<f64> {
        let mut out: Vec<f64> = vals
            .iter()
            .map(|x| (x + 1.0 - gap_pos).rem_euclid(1.0))
            .collect();
        out.sort_by(f64::total_cmp);
        out
    };
    let a_mod = shifted(a);
    let b_mod = shifted(b);
    a_mod
        .iter()
        .zip(b_mod.iter())
        .map(|(&x, &y)| periodic_dist(x, y))
        .fold(0.0, f64::max)
}

/// Minimal polarization change between consecutive entries, choosing the
/// branch offset in {-1, 0, +1} with the smallest magnitude.
pub fn pol_step(pol: &[f64]) -> Vec<f64> {
    pol.windows(2)
        .map(|w| {
            let left = w[0].rem_euclid(1.0);
            let right = w[1].rem_euclid(1.0);
            let mut best = right - left - 1.0;
            for offset in [0.0, 1.0] {
                let candidate = right - left + offset;
                if candidate.abs() < best.abs() {
                    best = candidate;
                }
            }
            best
        })
        .collect()
}

/// Sign contribution of one WCC relative to the gap positions of two
/// neighbouring lines: -1 when `x` lies strictly between them.
pub(crate) fn gap_crossing_sign(z: f64, z_plus: f64, x: f64) -> i32 {
    if z.max(z_plus) > x && z.min(z_plus) < x {
        -1
    } else {
        1
    }
}
