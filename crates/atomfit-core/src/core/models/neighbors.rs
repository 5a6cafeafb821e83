use candle_core::{DType, Device, Tensor};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONSISTENCY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum NeighborError {
    #[error("Invalid cutoff {0}: must be finite and positive")]
    InvalidCutoff(f64),

    #[error("Degenerate cell: lattice vectors are linearly dependent")]
    DegenerateCell,

    #[error("Neighbor pair {pair} references atom {atom}, but the system has {n_atoms} atoms")]
    AtomOutOfRange {
        pair: usize,
        atom: usize,
        n_atoms: usize,
    },

    #[error("Displacement tensor has shape {found:?}, expected [{expected}, 3]")]
    DisplacementShape { expected: usize, found: Vec<usize> },

    #[error(
        "Neighbor list is inconsistent with the system positions at pair {pair} (deviation {deviation:.3e})"
    )]
    InconsistentDisplacement { pair: usize, deviation: f64 },

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Options identifying a neighbor list: the cutoff radius and whether both
/// directions of every pair are stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NeighborListOptions {
    cutoff: f64,
    full_list: bool,
}

impl NeighborListOptions {
    pub fn new(cutoff: f64, full_list: bool) -> Self {
        Self { cutoff, full_list }
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn full_list(&self) -> bool {
        self.full_list
    }
}

impl PartialEq for NeighborListOptions {
    fn eq(&self, other: &Self) -> bool {
        self.cutoff.to_bits() == other.cutoff.to_bits() && self.full_list == other.full_list
    }
}

impl Eq for NeighborListOptions {}

/// A directed pair `first -> second`, where `second` lives in the periodic
/// image displaced by `shift` lattice vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeighborPair {
    pub first: usize,
    pub second: usize,
    pub shift: [i32; 3],
}

impl NeighborPair {
    pub fn new(first: usize, second: usize, shift: [i32; 3]) -> Self {
        Self {
            first,
            second,
            shift,
        }
    }

    /// The mirror pair `second -> first` with the opposite shift.
    pub fn reversed(&self) -> Self {
        Self {
            first: self.second,
            second: self.first,
            shift: [-self.shift[0], -self.shift[1], -self.shift[2]],
        }
    }
}

/// Pair records plus one displacement vector per pair
/// (`positions[second] - positions[first] + shift . cell`).
#[derive(Debug, Clone)]
pub struct NeighborList {
    pairs: Vec<NeighborPair>,
    displacements: Tensor,
}

impl NeighborList {
    /// Builds a neighbor list, checking that `displacements` has one row of
    /// three components per pair.
    pub fn new(pairs: Vec<NeighborPair>, displacements: Tensor) -> Result<Self, NeighborError> {
        let dims = displacements.dims();
        if dims.len() != 2 || dims[0] != pairs.len() || dims[1] != 3 {
            return Err(NeighborError::DisplacementShape {
                expected: pairs.len(),
                found: dims.to_vec(),
            });
        }
        Ok(Self {
            pairs,
            displacements,
        })
    }

    pub fn empty(device: &Device) -> Result<Self, NeighborError> {
        Ok(Self {
            pairs: Vec::new(),
            displacements: Tensor::zeros((0, 3), DType::F64, device)?,
        })
    }

    pub fn pairs(&self) -> &[NeighborPair] {
        &self.pairs
    }

    pub fn displacements(&self) -> &Tensor {
        &self.displacements
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn max_atom_index(&self) -> Option<usize> {
        self.pairs.iter().map(|p| p.first.max(p.second)).max()
    }
}

/// Computes the neighbor list of a structure with a brute-force sweep over
/// all lattice images that can hold a neighbor within `options.cutoff()`.
///
/// A cell made only of zeros marks a non-periodic structure, in which case
/// only the central image is searched.
///
/// # Arguments
///
/// * `positions` - Cartesian coordinates of every atom.
/// * `cell` - Lattice vectors stored as matrix rows.
/// * `options` - Cutoff and full/half selection.
/// * `device` - Device on which the displacement tensor is allocated.
///
/// # Errors
///
/// Returns an error for a non-positive cutoff or a singular non-zero cell.
pub fn compute_neighbor_list(
    positions: &[[f64; 3]],
    cell: &Matrix3<f64>,
    options: &NeighborListOptions,
    device: &Device,
) -> Result<NeighborList, NeighborError> {
    let cutoff = options.cutoff();
    if !cutoff.is_finite() || cutoff <= 0.0 {
        return Err(NeighborError::InvalidCutoff(cutoff));
    }

    let periodic = cell.iter().any(|v| *v != 0.0);
    let ranges = if periodic {
        image_ranges(positions, cell, cutoff)?
    } else {
        [0; 3]
    };

    let mut shifts = Vec::new();
    for a in -ranges[0]..=ranges[0] {
        for b in -ranges[1]..=ranges[1] {
            for c in -ranges[2]..=ranges[2] {
                shifts.push([a, b, c]);
            }
        }
    }

    let cutoff_sq = cutoff * cutoff;
    let lattice = cell.transpose();
    let points: Vec<Vector3<f64>> = positions.iter().map(|p| Vector3::from(*p)).collect();

    let mut pairs = Vec::new();
    let mut flat = Vec::new();
    for (i, pi) in points.iter().enumerate() {
        for (j, pj) in points.iter().enumerate() {
            for shift in &shifts {
                if i == j && *shift == [0, 0, 0] {
                    continue;
                }
                if !options.full_list() && !is_half_representative(i, j, shift) {
                    continue;
                }
                let offset = lattice
                    * Vector3::new(shift[0] as f64, shift[1] as f64, shift[2] as f64);
                let d = pj - pi + offset;
                if d.norm_squared() < cutoff_sq {
                    pairs.push(NeighborPair::new(i, j, *shift));
                    flat.extend_from_slice(&[d.x, d.y, d.z]);
                }
            }
        }
    }

    if pairs.is_empty() {
        return NeighborList::empty(device);
    }
    let n_pairs = pairs.len();
    NeighborList::new(pairs, Tensor::from_vec(flat, (n_pairs, 3), device)?)
}

fn is_half_representative(i: usize, j: usize, shift: &[i32; 3]) -> bool {
    if i != j {
        return i < j;
    }
    shift.iter().find(|s| **s != 0).is_some_and(|s| *s > 0)
}

fn image_ranges(
    positions: &[[f64; 3]],
    cell: &Matrix3<f64>,
    cutoff: f64,
) -> Result<[i32; 3], NeighborError> {
    let volume = cell.determinant().abs();
    if volume < 1e-12 {
        return Err(NeighborError::DegenerateCell);
    }
    let inverse = cell.try_inverse().ok_or(NeighborError::DegenerateCell)?;

    let mut low = [f64::INFINITY; 3];
    let mut high = [f64::NEG_INFINITY; 3];
    for p in positions {
        let frac = Vector3::from(*p).transpose() * inverse;
        for k in 0..3 {
            low[k] = low[k].min(frac[k]);
            high[k] = high[k].max(frac[k]);
        }
    }

    let rows: [Vector3<f64>; 3] = [
        cell.row(0).transpose(),
        cell.row(1).transpose(),
        cell.row(2).transpose(),
    ];
    let mut ranges = [0; 3];
    for k in 0..3 {
        let normal = rows[(k + 1) % 3].cross(&rows[(k + 2) % 3]).norm();
        let spacing = volume / normal;
        let span = if positions.is_empty() {
            0.0
        } else {
            high[k] - low[k]
        };
        ranges[k] = (cutoff / spacing + span).ceil() as i32;
    }
    Ok(ranges)
}

/// Recomputes the displacements of `list` from `positions` and `cell` so that
/// they become differentiable functions of both tensors.
///
/// With `check_consistency`, the recomputed displacements must match the
/// stored ones to within a small tolerance.
pub fn register_autograd_neighbors(
    positions: &Tensor,
    cell: &Tensor,
    list: &NeighborList,
    check_consistency: bool,
) -> Result<NeighborList, NeighborError> {
    if list.is_empty() {
        return NeighborList::empty(positions.device());
    }

    let n_atoms = positions.dim(0)?;
    let mut first = Vec::with_capacity(list.len());
    let mut second = Vec::with_capacity(list.len());
    let mut shifts = Vec::with_capacity(3 * list.len());
    for (index, pair) in list.pairs().iter().enumerate() {
        for atom in [pair.first, pair.second] {
            if atom >= n_atoms {
                return Err(NeighborError::AtomOutOfRange {
                    pair: index,
                    atom,
                    n_atoms,
                });
            }
        }
        first.push(pair.first as u32);
        second.push(pair.second as u32);
        shifts.extend(pair.shift.iter().map(|s| *s as f64));
    }

    let device = positions.device();
    let n_pairs = list.len();
    let first = Tensor::from_vec(first, n_pairs, device)?;
    let second = Tensor::from_vec(second, n_pairs, device)?;
    let shifts = Tensor::from_vec(shifts, (n_pairs, 3), device)?;

    let displacements = positions
        .index_select(&second, 0)?
        .sub(&positions.index_select(&first, 0)?)?
        .add(&shifts.matmul(cell)?)?;

    if check_consistency {
        let recomputed = displacements.to_vec2::<f64>()?;
        let stored = list.displacements().to_vec2::<f64>()?;
        for (pair, (new, old)) in recomputed.iter().zip(stored.iter()).enumerate() {
            let deviation = new
                .iter()
                .zip(old.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            if deviation > CONSISTENCY_TOLERANCE {
                return Err(NeighborError::InconsistentDisplacement { pair, deviation });
            }
        }
    }

    NeighborList::new(list.pairs().to_vec(), displacements)
}
