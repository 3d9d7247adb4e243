//! `.npy` persistence for cubes, guess grids and model grids.
//!
//! Plain reads pull the whole array into memory. Model grids can also be
//! memory-mapped so that selection works on grids larger than RAM.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use ndarray::{Array2, Array3, ArrayD, ArrayView, Dimension, Ix2, Ix3};
use ndarray_npy::{read_npy, write_npy};

use crate::error::CubeError;

pub fn save_array<D: Dimension>(path: &Path, array: ArrayView<'_, f64, D>) -> Result<(), CubeError> {
    write_npy(path, &array).map_err(|e| CubeError::npy(path, e))?;
    log::info!("Wrote {:?} array to {}", array.shape(), path.display());
    Ok(())
}

/// Read an array of any dimensionality.
pub fn load_dyn(path: &Path) -> Result<ArrayD<f64>, CubeError> {
    read_npy::<_, ArrayD<f64>>(path).map_err(|e| CubeError::npy(path, e))
}

pub fn load_array2(path: &Path) -> Result<Array2<f64>, CubeError> {
    let array = load_dyn(path)?;
    let ndim = array.ndim();
    array.into_dimensionality::<Ix2>().map_err(|_| {
        CubeError::InvalidShape(format!(
            "'{}' holds a {ndim}-dimensional array, expected 2.",
            path.display()
        ))
    })
}

/// Read a (channel × Y × X) cube.
pub fn load_array3(path: &Path) -> Result<Array3<f64>, CubeError> {
    let array = load_dyn(path)?;
    let ndim = array.ndim();
    array.into_dimensionality::<Ix3>().map_err(|_| {
        CubeError::InvalidShape(format!(
            "'{}' holds a {ndim}-dimensional array, expected a 3D cube.",
            path.display()
        ))
    })
}

/// Memory-map a file read-only.
pub fn map_file(path: &Path) -> Result<Mmap, CubeError> {
    let file = File::open(path).map_err(|e| CubeError::io(path, e))?;
    // SAFETY: the map is read-only; the file must not be truncated while mapped,
    // which is the caller's contract for persisted model grids.
    unsafe { Mmap::map(&file) }.map_err(|e| CubeError::io(path, e))
}
