//! The spectral cube: flux array, spectral axis and header.

use ndarray::{Array3, ArrayView1, ArrayView3, Axis, concatenate, s};

use crate::domain::types::{CubeHeader, SpectralAxis};
use crate::error::CubeError;

/// A (channel × Y × X) flux array with its spectral axis and header cards.
#[derive(Debug, Clone)]
pub struct SpectralCube {
    data: Array3<f64>,
    xarr: SpectralAxis,
    header: CubeHeader,
}

impl SpectralCube {
    pub fn new(data: Array3<f64>, xarr: SpectralAxis, header: CubeHeader) -> Result<Self, CubeError> {
        let (nc, ny, nx) = data.dim();
        if nc != xarr.len() {
            return Err(CubeError::InvalidShape(format!(
                "Cube has {nc} channels but the spectral axis has {}.",
                xarr.len()
            )));
        }
        if ny == 0 || nx == 0 {
            return Err(CubeError::InvalidShape(format!(
                "Cube has an empty spatial plane ({ny}×{nx})."
            )));
        }
        Ok(Self { data, xarr, header })
    }

    /// Concatenate cubes along the spectral axis.
    ///
    /// All cubes must share the spatial shape and spectral unit. The axis
    /// metadata of the first cube is kept; header cards are merged with the
    /// first cube taking precedence.
    pub fn stack(cubes: Vec<SpectralCube>) -> Result<Self, CubeError> {
        let Some(first) = cubes.first() else {
            return Err(CubeError::Precondition("No cubes to stack.".into()));
        };
        let spatial = first.spatial_shape();
        let unit = first.xarr.unit();
        for (i, c) in cubes.iter().enumerate().skip(1) {
            if c.spatial_shape() != spatial {
                return Err(CubeError::InvalidShape(format!(
                    "Cube #{i} has spatial shape {:?}, expected {spatial:?}.",
                    c.spatial_shape()
                )));
            }
            if c.xarr.unit() != unit {
                return Err(CubeError::InvalidInput(format!(
                    "Cube #{i} has spectral unit {}, expected {}.",
                    c.xarr.unit().label(),
                    unit.label()
                )));
            }
        }

        let views: Vec<ArrayView3<f64>> = cubes.iter().map(|c| c.data.view()).collect();
        let data = concatenate(Axis(0), &views)
            .map_err(|e| CubeError::InvalidShape(format!("Cannot stack cubes: {e}")))?;

        let values: Vec<f64> = cubes
            .iter()
            .flat_map(|c| c.xarr.values().iter().copied())
            .collect();
        let mut xarr = SpectralAxis::new(values, unit)?;
        if let Some(conv) = first.xarr.convention() {
            xarr = xarr.with_convention(conv);
        }
        if let Some(rest) = first.xarr.rest_frequency() {
            xarr = xarr.with_rest_frequency(rest);
        }

        let mut header = first.header.clone();
        for c in &cubes[1..] {
            header.merge_missing(&c.header);
        }

        log::info!(
            "Stacked {} cubes into {} channels",
            cubes.len(),
            xarr.len()
        );
        Self::new(data, xarr, header)
    }

    pub fn data(&self) -> ArrayView3<'_, f64> {
        self.data.view()
    }

    pub fn xarr(&self) -> &SpectralAxis {
        &self.xarr
    }

    pub fn header(&self) -> &CubeHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut CubeHeader {
        &mut self.header
    }

    pub fn n_channels(&self) -> usize {
        self.data.dim().0
    }

    /// `(ny, nx)`.
    pub fn spatial_shape(&self) -> (usize, usize) {
        let (_, ny, nx) = self.data.dim();
        (ny, nx)
    }

    pub fn n_pixels(&self) -> usize {
        let (ny, nx) = self.spatial_shape();
        ny * nx
    }

    /// Size of the flux array in bytes.
    pub fn nbytes(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f64>()) as u64
    }

    pub fn spectrum(&self, y: usize, x: usize) -> ArrayView1<'_, f64> {
        self.data.slice(s![.., y, x])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{SpectralUnit, VelocityConvention};

    fn cube(nc: usize, offset: f64) -> SpectralCube {
        let data = Array3::from_shape_fn((nc, 2, 3), |(c, y, x)| c as f64 + 10.0 * y as f64 + x as f64);
        let values = (0..nc).map(|i| offset + i as f64).collect();
        let xarr = SpectralAxis::new(values, SpectralUnit::KilometersPerSecond)
            .unwrap()
            .with_convention(VelocityConvention::Radio);
        SpectralCube::new(data, xarr, CubeHeader::default()).unwrap()
    }

    #[test]
    fn rejects_axis_length_mismatch() {
        let data = Array3::<f64>::zeros((4, 2, 2));
        let xarr = SpectralAxis::new(vec![0.0; 3], SpectralUnit::Channel).unwrap();
        let err = SpectralCube::new(data, xarr, CubeHeader::default()).unwrap_err();
        assert!(matches!(err, CubeError::InvalidShape(_)));
    }

    #[test]
    fn stack_concatenates_channels() {
        let mut a = cube(3, 0.0);
        a.header_mut().set_rms_level(0.1);
        let b = cube(2, 10.0);
        let stacked = SpectralCube::stack(vec![a, b]).unwrap();
        assert_eq!(stacked.n_channels(), 5);
        assert_eq!(stacked.xarr().values(), &[0.0, 1.0, 2.0, 10.0, 11.0]);
        assert_eq!(stacked.xarr().convention(), Some(VelocityConvention::Radio));
        assert_eq!(stacked.header().rms_level(), Some(0.1));
        assert_eq!(stacked.spectrum(1, 2)[3], 12.0);
    }

    #[test]
    fn stack_rejects_spatial_mismatch() {
        let a = cube(3, 0.0);
        let data = Array3::<f64>::zeros((2, 3, 3));
        let xarr = SpectralAxis::new(vec![0.0, 1.0], SpectralUnit::KilometersPerSecond).unwrap();
        let b = SpectralCube::new(data, xarr, CubeHeader::default()).unwrap();
        assert!(SpectralCube::stack(vec![a, b]).is_err());
    }

    #[test]
    fn nbytes_counts_f64_elements() {
        assert_eq!(cube(4, 0.0).nbytes(), 4 * 2 * 3 * 8);
    }
}
