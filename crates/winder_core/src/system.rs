//! Oracle interface between the engine and the physical system.
//!
//! The engine never inspects where its matrices come from. A system either
//! provides periodic eigenstates ([`EigenstateSystem`]) or overlap matrices
//! directly ([`OverlapSystem`]); implementing one of the two is enough,
//! since [`EigenstateOverlaps`] turns any eigenstate system into an overlap
//! oracle. [`MatrixHamiltonian`] wraps an explicit `k -> H(k)` closure
//! (k.p models, small lattice models) as an eigenstate system.

use std::f64::consts::TAU;

use nalgebra::linalg::SymmetricEigen;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::wcc::ComplexMatrix;

/// Oracle providing periodic eigenstates at the given k-points.
///
/// One matrix per k-point, occupied states as columns. The final entry must
/// close the loop: it corresponds to the first k-point shifted by the
/// reciprocal lattice vector connecting the endpoints, including any phase
/// picked up across it.
pub trait EigenstateSystem {
    fn eigenstates(&self, kpts: &[[f64; 3]]) -> Result<Vec<ComplexMatrix>>;
}

/// Oracle providing overlap matrices between consecutive k-points.
pub trait OverlapSystem {
    /// Returns `kpts.len() - 1` matrices, one per consecutive k-point pair,
    /// in input order.
    fn overlaps(&self, kpts: &[[f64; 3]]) -> Result<Vec<ComplexMatrix>>;
}

/// Overlaps `M_i = C_i^dagger C_{i+1}` from consecutive eigenstate sets.
pub fn overlaps_from_eigenstates(eigs: &[ComplexMatrix]) -> Vec<ComplexMatrix> {
    eigs.windows(2)
        .map(|pair| pair[0].adjoint() * &pair[1])
        .collect()
}

/// Adapter declaring an eigenstate system as an overlap oracle.
///
/// Systems implement exactly one of the two traits; wrapping in this type
/// is the explicit declaration that overlaps are to be derived from
/// eigenstates.
pub struct EigenstateOverlaps<S>(pub S);

impl<S: EigenstateSystem> OverlapSystem for EigenstateOverlaps<S> {
    fn overlaps(&self, kpts: &[[f64; 3]]) -> Result<Vec<ComplexMatrix>> {
        Ok(overlaps_from_eigenstates(&self.0.eigenstates(kpts)?))
    }
}

/// Which bands count as occupied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandSelection {
    /// The `n` lowest-energy bands.
    Count(usize),
    /// Explicit indices into the energy-sorted spectrum.
    Indices(Vec<usize>),
}

/// Gauge convention for the returned states, following the pythtb
/// formalism: eigenvectors of H(k) taken as the full Bloch wave (1) or as
/// the cell-periodic part (2, the default), which differ by orbital
/// position phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GaugeConvention {
    Wavefunction,
    CellPeriodic,
}

/// Settings for [`MatrixHamiltonian`].
#[derive(Debug, Clone)]
pub struct HamiltonianSettings {
    /// Occupied bands; default: the lower half of the spectrum.
    pub bands: Option<BandSelection>,
    /// Orbital positions in reduced coordinates; default: all at the origin.
    pub pos: Option<Vec<[f64; 3]>>,
    /// Maximum tolerated asymmetry `max |H - H^dagger|`. `None` disables the
    /// check entirely.
    pub hermitian_tol: Option<f64>,
    pub convention: GaugeConvention,
    /// Probe H at the corners of the unit cube as a cheap periodicity check.
    pub check_periodic: bool,
}

impl Default for HamiltonianSettings {
    fn default() -> Self {
        Self {
            bands: None,
            pos: None,
            hermitian_tol: Some(1e-6),
            convention: GaugeConvention::CellPeriodic,
            check_periodic: false,
        }
    }
}

/// Eigenstate system described by an explicit matrix Hamiltonian `H(k)`.
pub struct MatrixHamiltonian<H> {
    hamilton: H,
    basis_overlap: Option<Box<dyn Fn([f64; 3]) -> ComplexMatrix + Send + Sync>>,
    bands: Vec<usize>,
    pos: Vec<[f64; 3]>,
    hermitian_tol: Option<f64>,
    convention: GaugeConvention,
    size: usize,
}

impl<H> MatrixHamiltonian<H>
where
    H: Fn([f64; 3]) -> ComplexMatrix,
{
    pub fn new(hamilton: H, settings: HamiltonianSettings) -> Result<Self> {
        let probe = hamilton([0.0; 3]);
        if probe.nrows() != probe.ncols() {
            return Err(Error::ControlConfig(format!(
                "Hamiltonian must be square, got {}x{}",
                probe.nrows(),
                probe.ncols()
            )));
        }
        let size = probe.nrows();

        if settings.check_periodic {
            for corner in 1..8_u32 {
                let k = [
                    f64::from(corner & 1),
                    f64::from((corner >> 1) & 1),
                    f64::from((corner >> 2) & 1),
                ];
                let at_corner = hamilton(k);
                let deviation = (&at_corner - &probe)
                    .iter()
                    .map(|z| z.norm())
                    .fold(0.0, f64::max);
                if deviation > 1e-8 {
                    return Err(Error::ControlConfig(format!(
                        "Hamiltonian is not periodic: H(k={k:?}) deviates from H(0) by {deviation:e}"
                    )));
                }
            }
        }

        let bands = match settings.bands {
            None => (0..size / 2).collect(),
            Some(BandSelection::Count(n)) => {
                if n > size {
                    return Err(Error::ControlConfig(format!(
                        "cannot occupy {n} bands of a {size}-band Hamiltonian"
                    )));
                }
                (0..n).collect()
            }
            Some(BandSelection::Indices(mut idx)) => {
                if idx.iter().any(|&i| i >= size) {
                    return Err(Error::ControlConfig(format!(
                        "band index out of range for a {size}-band Hamiltonian"
                    )));
                }
                idx.sort_unstable();
                idx
            }
        };

        let pos = match settings.pos {
            None => vec![[0.0; 3]; size],
            Some(pos) => {
                if pos.len() != size {
                    return Err(Error::ControlConfig(format!(
                        "got {} orbital positions for a {size}-band Hamiltonian",
                        pos.len()
                    )));
                }
                pos
            }
        };

        Ok(Self {
            hamilton,
            basis_overlap: None,
            bands,
            pos,
            hermitian_tol: settings.hermitian_tol,
            convention: settings.convention,
            size,
        })
    }

    /// Declares the basis non-orthogonal: `overlap(k)` returns S(k), and the
    /// Hamiltonian is Loewdin-orthogonalized as `S^-1/2 H S^-1/2` before
    /// diagonalization.
    pub fn with_basis_overlap<F>(mut self, overlap: F) -> Result<Self>
    where
        F: Fn([f64; 3]) -> ComplexMatrix + Send + Sync + 'static,
    {
        let probe = overlap([0.0; 3]);
        if probe.nrows() != self.size || probe.ncols() != self.size {
            return Err(Error::ControlConfig(format!(
                "basis overlap is {}x{}, Hamiltonian is {}x{}",
                probe.nrows(),
                probe.ncols(),
                self.size,
                self.size
            )));
        }
        self.basis_overlap = Some(Box::new(overlap));
        Ok(self)
    }

    fn check_hermitian(&self, m: &ComplexMatrix) -> Result<()> {
        let Some(tol) = self.hermitian_tol else {
            return Ok(());
        };
        let max_diff = (m - m.adjoint())
            .iter()
            .map(|z| z.norm())
            .fold(0.0, f64::max);
        if max_diff > tol {
            return Err(Error::NonHermitian { max_diff, tol });
        }
        Ok(())
    }
}

impl<H> EigenstateSystem for MatrixHamiltonian<H>
where
    H: Fn([f64; 3]) -> ComplexMatrix,
{
    fn eigenstates(&self, kpts: &[[f64; 3]]) -> Result<Vec<ComplexMatrix>> {
        if kpts.len() < 2 {
            return Err(Error::ControlConfig(
                "an eigenstate oracle needs at least two k-points".into(),
            ));
        }

        let mut eigs = Vec::with_capacity(kpts.len());
        for &k in &kpts[..kpts.len() - 1] {
            let mut ham = (self.hamilton)(k);
            self.check_hermitian(&ham)?;
            if let Some(overlap) = &self.basis_overlap {
                let s = overlap(k);
                self.check_hermitian(&s)?;
                let s_inv_sqrt = inv_sqrt_hermitian(&s)?;
                ham = &s_inv_sqrt * ham * &s_inv_sqrt;
            }
            let mut states = occupied_columns(&ham, &self.bands);
            if self.convention == GaugeConvention::CellPeriodic {
                apply_position_phases(&mut states, &self.pos, k);
            }
            eigs.push(states);
        }

        // The last Bloch state set equals the first up to the phase picked
        // up across the connecting reciprocal lattice vector.
        let k_first = kpts[0];
        let k_last = kpts[kpts.len() - 1];
        let mut closing = eigs[0].clone();
        apply_position_phases(
            &mut closing,
            &self.pos,
            [
                k_last[0] - k_first[0],
                k_last[1] - k_first[1],
                k_last[2] - k_first[2],
            ],
        );
        eigs.push(closing);
        Ok(eigs)
    }
}

impl<H> OverlapSystem for MatrixHamiltonian<H>
where
    H: Fn([f64; 3]) -> ComplexMatrix,
{
    fn overlaps(&self, kpts: &[[f64; 3]]) -> Result<Vec<ComplexMatrix>> {
        Ok(overlaps_from_eigenstates(&self.eigenstates(kpts)?))
    }
}

fn occupied_columns(ham: &ComplexMatrix, bands: &[usize]) -> ComplexMatrix {
    let eig = SymmetricEigen::new(ham.clone());
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));

    let mut out = ComplexMatrix::zeros(ham.nrows(), bands.len());
    for (col, &band) in bands.iter().enumerate() {
        out.set_column(col, &eig.eigenvectors.column(order[band]));
    }
    out
}

fn inv_sqrt_hermitian(s: &ComplexMatrix) -> Result<ComplexMatrix> {
    let n = s.nrows();
    let eig = SymmetricEigen::new(s.clone());
    let mut diag = ComplexMatrix::zeros(n, n);
    for i in 0..n {
        let e = eig.eigenvalues[i];
        if e <= 0.0 {
            return Err(Error::Numerical(
                "basis overlap matrix is not positive definite".into(),
            ));
        }
        diag[(i, i)] = Complex::new(1.0 / e.sqrt(), 0.0);
    }
    Ok(&eig.eigenvectors * diag * eig.eigenvectors.adjoint())
}

fn apply_position_phases(states: &mut ComplexMatrix, pos: &[[f64; 3]], k: [f64; 3]) {
    for (row, p) in pos.iter().enumerate() {
        let angle = -TAU * (p[0] * k[0] + p[1] * k[1] + p[2] * k[2]);
        let factor = Complex::from_polar(1.0, angle);
        for col in 0..states.ncols() {
            states[(row, col)] *= factor;
        }
    }
}
