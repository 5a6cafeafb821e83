use super::neighbors::{
    NeighborError, NeighborList, NeighborListOptions, compute_neighbor_list,
    register_autograd_neighbors,
};
use candle_core::{DType, Device, Tensor};
use nalgebra::Matrix3;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Invalid {what} shape {found:?}, expected {expected:?}")]
    Shape {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Got {types} atom types for {positions} positions")]
    TypeCount { types: usize, positions: usize },

    #[error("Neighbor list error: {0}")]
    Neighbors(#[from] NeighborError),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// An atomic structure: positions, atom types, a cell and cached neighbor
/// lists.
///
/// Positions are an `(n_atoms, 3)` f64 tensor and the cell a `(3, 3)` tensor
/// whose rows are lattice vectors; an all-zero cell marks a non-periodic
/// structure. Cloning is cheap because tensors are reference counted.
#[derive(Debug, Clone)]
pub struct System {
    positions: Tensor,
    types: Vec<i32>,
    cell: Tensor,
    periodic: bool,
    neighbor_lists: Vec<(NeighborListOptions, NeighborList)>,
}

impl System {
    /// Creates a system from tensors.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Shape`] if `positions` is not `(n, 3)` or `cell`
    /// is not `(3, 3)`, and [`SystemError::TypeCount`] when `types` does not
    /// have one entry per atom.
    pub fn new(positions: Tensor, types: Vec<i32>, cell: Tensor) -> Result<Self, SystemError> {
        let dims = positions.dims();
        if dims.len() != 2 || dims[1] != 3 {
            return Err(SystemError::Shape {
                what: "positions",
                expected: vec![types.len(), 3],
                found: dims.to_vec(),
            });
        }
        if dims[0] != types.len() {
            return Err(SystemError::TypeCount {
                types: types.len(),
                positions: dims[0],
            });
        }
        if cell.dims() != [3, 3] {
            return Err(SystemError::Shape {
                what: "cell",
                expected: vec![3, 3],
                found: cell.dims().to_vec(),
            });
        }
        let periodic = cell
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?
            .iter()
            .any(|v| *v != 0.0);

        Ok(Self {
            positions,
            types,
            cell,
            periodic,
            neighbor_lists: Vec::new(),
        })
    }

    /// Creates a system from host coordinates; `None` for the cell gives a
    /// non-periodic structure.
    pub fn from_coordinates(
        positions: &[[f64; 3]],
        types: Vec<i32>,
        cell: Option<[[f64; 3]; 3]>,
        device: &Device,
    ) -> Result<Self, SystemError> {
        let flat: Vec<f64> = positions.iter().flatten().copied().collect();
        let positions = Tensor::from_vec(flat, (positions.len(), 3), device)?;
        let cell = match cell {
            Some(rows) => {
                let flat: Vec<f64> = rows.iter().flatten().copied().collect();
                Tensor::from_vec(flat, (3, 3), device)?
            }
            None => Tensor::zeros((3, 3), DType::F64, device)?,
        };
        Self::new(positions, types, cell)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn positions(&self) -> &Tensor {
        &self.positions
    }

    pub fn types(&self) -> &[i32] {
        &self.types
    }

    pub fn cell(&self) -> &Tensor {
        &self.cell
    }

    pub fn device(&self) -> &Device {
        self.positions.device()
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub fn positions_host(&self) -> Result<Vec<[f64; 3]>, SystemError> {
        Ok(self
            .positions
            .to_vec2::<f64>()?
            .into_iter()
            .map(|row| [row[0], row[1], row[2]])
            .collect())
    }

    pub fn cell_matrix(&self) -> Result<Matrix3<f64>, SystemError> {
        let flat = self.cell.flatten_all()?.to_vec1::<f64>()?;
        Ok(Matrix3::from_row_slice(&flat))
    }

    /// Stores a neighbor list under `options`, replacing any list already
    /// registered with the same options.
    pub fn add_neighbor_list(
        &mut self,
        options: NeighborListOptions,
        list: NeighborList,
    ) -> Result<(), SystemError> {
        if let Some(atom) = list.max_atom_index() {
            if atom >= self.len() {
                return Err(NeighborError::AtomOutOfRange {
                    pair: list
                        .pairs()
                        .iter()
                        .position(|p| p.first.max(p.second) == atom)
                        .unwrap_or(0),
                    atom,
                    n_atoms: self.len(),
                }
                .into());
            }
        }
        match self.neighbor_lists.iter_mut().find(|(o, _)| *o == options) {
            Some(entry) => entry.1 = list,
            None => self.neighbor_lists.push((options, list)),
        }
        Ok(())
    }

    pub fn get_neighbor_list(&self, options: &NeighborListOptions) -> Option<&NeighborList> {
        self.neighbor_lists
            .iter()
            .find(|(o, _)| o == options)
            .map(|(_, list)| list)
    }

    pub fn known_neighbor_lists(&self) -> impl Iterator<Item = &NeighborListOptions> {
        self.neighbor_lists.iter().map(|(o, _)| o)
    }

    /// Computes the neighbor list for `options` and caches it, unless one is
    /// already present.
    pub fn attach_neighbor_list(&mut self, options: NeighborListOptions) -> Result<(), SystemError> {
        if self.get_neighbor_list(&options).is_some() {
            return Ok(());
        }
        let list = compute_neighbor_list(
            &self.positions_host()?,
            &self.cell_matrix()?,
            &options,
            self.device(),
        )?;
        self.add_neighbor_list(options, list)
    }

    /// Returns a copy of this system built on new positions and cell tensors,
    /// with every known neighbor list re-registered so its displacements are
    /// differentiable functions of the new tensors.
    pub fn with_positions_and_cell(
        &self,
        positions: Tensor,
        cell: Tensor,
    ) -> Result<Self, SystemError> {
        let mut derived = Self::new(positions, self.types.clone(), cell)?;
        for (options, list) in &self.neighbor_lists {
            let registered =
                register_autograd_neighbors(&derived.positions, &derived.cell, list, true)?;
            derived.neighbor_lists.push((*options, registered));
        }
        Ok(derived)
    }

    /// Swaps the position tensor in place and re-registers every neighbor
    /// list against it.
    pub fn replace_positions(&mut self, positions: Tensor) -> Result<(), SystemError> {
        if positions.dims() != self.positions.dims() {
            return Err(SystemError::Shape {
                what: "positions",
                expected: self.positions.dims().to_vec(),
                found: positions.dims().to_vec(),
            });
        }
        let mut lists = Vec::with_capacity(self.neighbor_lists.len());
        for (options, list) in &self.neighbor_lists {
            lists.push((
                *options,
                register_autograd_neighbors(&positions, &self.cell, list, true)?,
            ));
        }
        self.positions = positions;
        self.neighbor_lists = lists;
        Ok(())
    }
}
