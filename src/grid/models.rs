//! Model grids: one synthetic spectrum per guess-grid entry (`G × C`).

use std::path::{Path, PathBuf};

use memmap2::Mmap;
use ndarray::{Array2, ArrayView2, ArrayViewD, Axis, Ix2};
use ndarray_npy::ViewNpyExt;

use crate::error::CubeError;
use crate::io::npy::{load_dyn, map_file, save_array};

/// How a persisted model grid is brought back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Read the whole grid into memory.
    #[default]
    Read,
    /// Memory-map the file; the grid stays out of core.
    MemoryMap,
}

#[derive(Debug)]
pub enum ModelGrid {
    InMemory(Array2<f64>),
    Mapped { path: PathBuf, mmap: Mmap },
}

impl ModelGrid {
    pub fn from_array(models: Array2<f64>) -> Self {
        ModelGrid::InMemory(models)
    }

    /// Open a grid written by [`ModelGrid::save`] or by the synthesizer.
    ///
    /// A 1D file is a single model. Grids with more than two axes (spatially
    /// varying models) are rejected as unsupported.
    pub fn open(path: &Path, mode: LoadMode) -> Result<Self, CubeError> {
        let grid = match mode {
            LoadMode::Read => {
                let array = load_dyn(path)?;
                let models = as_model_grid(array.view(), path)?.to_owned();
                ModelGrid::InMemory(models)
            }
            LoadMode::MemoryMap => {
                let mmap = map_file(path)?;
                let grid = ModelGrid::Mapped {
                    path: path.to_path_buf(),
                    mmap,
                };
                // Validate the header once up front.
                grid.view()?;
                grid
            }
        };
        let (g, c) = grid.shape()?;
        log::info!(
            "Loaded {g}×{c} model grid from {} ({})",
            path.display(),
            if grid.is_out_of_core() { "memory-mapped" } else { "in memory" }
        );
        Ok(grid)
    }

    pub fn view(&self) -> Result<ArrayView2<'_, f64>, CubeError> {
        match self {
            ModelGrid::InMemory(models) => Ok(models.view()),
            ModelGrid::Mapped { path, mmap } => {
                let view = ArrayViewD::<f64>::view_npy(&mmap[..]).map_err(|e| CubeError::npy(path, e))?;
                as_model_grid(view, path)
            }
        }
    }

    /// `(n_models, n_channels)`.
    pub fn shape(&self) -> Result<(usize, usize), CubeError> {
        Ok(self.view()?.dim())
    }

    pub fn is_out_of_core(&self) -> bool {
        matches!(self, ModelGrid::Mapped { .. })
    }

    pub fn save(&self, path: &Path) -> Result<(), CubeError> {
        save_array(path, self.view()?)
    }
}

fn as_model_grid<'a>(view: ArrayViewD<'a, f64>, path: &Path) -> Result<ArrayView2<'a, f64>, CubeError> {
    match view.ndim() {
        1 => view
            .insert_axis(Axis(0))
            .into_dimensionality::<Ix2>()
            .map_err(|e| CubeError::InvalidShape(format!("'{}': {e}", path.display()))),
        2 => view
            .into_dimensionality::<Ix2>()
            .map_err(|e| CubeError::InvalidShape(format!("'{}': {e}", path.display()))),
        n => Err(CubeError::NotSupported(format!(
            "'{}' holds a {n}-dimensional model grid; only (models × channels) grids are supported.",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, array};

    #[test]
    fn mapped_and_read_grids_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.npy");
        let models = array![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]];
        ModelGrid::from_array(models.clone()).save(&path).unwrap();

        let read = ModelGrid::open(&path, LoadMode::Read).unwrap();
        let mapped = ModelGrid::open(&path, LoadMode::MemoryMap).unwrap();
        assert!(!read.is_out_of_core());
        assert!(mapped.is_out_of_core());
        assert_eq!(read.view().unwrap(), models);
        assert_eq!(mapped.view().unwrap(), models);
        assert_eq!(mapped.shape().unwrap(), (2, 3));
    }

    #[test]
    fn single_model_file_is_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.npy");
        save_array(&path, array![1.0, 2.0, 3.0].view()).unwrap();
        let grid = ModelGrid::open(&path, LoadMode::MemoryMap).unwrap();
        assert_eq!(grid.shape().unwrap(), (1, 3));
    }

    #[test]
    fn spatial_model_grids_are_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spatial.npy");
        save_array(&path, Array3::<f64>::zeros((2, 3, 4)).view()).unwrap();
        assert!(matches!(
            ModelGrid::open(&path, LoadMode::Read),
            Err(CubeError::NotSupported(_))
        ));
    }
}
