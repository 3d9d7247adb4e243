//! Cube files: a 3D `.npy` flux array plus a JSON header.
//!
//! ```json
//! {
//!   "spectral_axis": {"crval": -15.0, "cdelt": 0.5, "crpix": 1, "unit": "km/s"},
//!   "cards": {"RMSLVL": 0.05, "BUNIT": "K"}
//! }
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{CubeHeader, SpectralAxis, SpectralAxisSpec, SpectralCube};
use crate::error::CubeError;
use crate::io::npy::{load_array3, save_array};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderFile {
    pub spectral_axis: SpectralAxisSpec,
    #[serde(default)]
    pub cards: CubeHeader,
}

pub fn read_header(path: &Path) -> Result<HeaderFile, CubeError> {
    let file = File::open(path).map_err(|e| CubeError::io(path, e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

pub fn write_header(path: &Path, header: &HeaderFile) -> Result<(), CubeError> {
    let file = File::create(path).map_err(|e| CubeError::io(path, e))?;
    serde_json::to_writer_pretty(file, header)?;
    Ok(())
}

/// Load a cube and build its spectral axis from the header WCS.
pub fn load_cube(data_path: &Path, header_path: &Path) -> Result<SpectralCube, CubeError> {
    let header = read_header(header_path)?;
    let data = load_array3(data_path)?;
    let xarr = SpectralAxis::from_spec(data.dim().0, &header.spectral_axis)?;
    let cube = SpectralCube::new(data, xarr, header.cards)?;
    let (ny, nx) = cube.spatial_shape();
    log::info!(
        "Loaded {}×{ny}×{nx} cube from {} ({})",
        cube.n_channels(),
        data_path.display(),
        cube.xarr().unit().label()
    );
    Ok(cube)
}

/// Load and concatenate several cubes along the spectral axis.
pub fn load_stacked(pairs: &[(impl AsRef<Path>, impl AsRef<Path>)]) -> Result<SpectralCube, CubeError> {
    let cubes = pairs
        .iter()
        .map(|(data, header)| load_cube(data.as_ref(), header.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    if cubes.len() == 1 {
        return cubes
            .into_iter()
            .next()
            .ok_or_else(|| CubeError::Precondition("No cube given.".into()));
    }
    SpectralCube::stack(cubes)
}

pub fn save_cube(cube: &SpectralCube, spec: &SpectralAxisSpec, data_path: &Path, header_path: &Path) -> Result<(), CubeError> {
    save_array(data_path, cube.data())?;
    write_header(
        header_path,
        &HeaderFile {
            spectral_axis: spec.clone(),
            cards: cube.header().clone(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SpectralUnit;
    use ndarray::Array3;

    fn spec() -> SpectralAxisSpec {
        SpectralAxisSpec {
            crval: -15.0,
            cdelt: 0.5,
            crpix: 1.0,
            unit: SpectralUnit::KilometersPerSecond,
            convention: None,
            rest_frequency: None,
        }
    }

    #[test]
    fn header_json_parses_with_defaults() {
        let header: HeaderFile = serde_json::from_str(
            r#"{"spectral_axis": {"crval": 1.0, "cdelt": 0.1, "crpix": 1, "unit": "km/s"}}"#,
        )
        .unwrap();
        assert_eq!(header.spectral_axis.unit, SpectralUnit::KilometersPerSecond);
        assert_eq!(header.cards.rms_level(), None);
    }

    #[test]
    fn cube_round_trip_keeps_axis_and_cards() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("cube.npy");
        let header_path = dir.path().join("cube.json");

        let data = Array3::from_shape_fn((8, 2, 3), |(c, y, x)| (c + y + x) as f64);
        let xarr = SpectralAxis::from_spec(8, &spec()).unwrap();
        let mut cards = CubeHeader::default();
        cards.set_rms_level(0.05);
        let cube = SpectralCube::new(data, xarr, cards).unwrap();
        save_cube(&cube, &spec(), &data_path, &header_path).unwrap();

        let loaded = load_cube(&data_path, &header_path).unwrap();
        assert_eq!(loaded.data(), cube.data());
        assert_eq!(loaded.xarr().values(), cube.xarr().values());
        assert_eq!(loaded.header().rms_level(), Some(0.05));
    }

    #[test]
    fn stacked_cubes_concatenate_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut pairs = Vec::new();
        for i in 0..2 {
            let data_path = dir.path().join(format!("c{i}.npy"));
            let header_path = dir.path().join(format!("c{i}.json"));
            let xarr = SpectralAxis::from_spec(4, &spec()).unwrap();
            let cube = SpectralCube::new(Array3::from_elem((4, 2, 2), i as f64), xarr, CubeHeader::default()).unwrap();
            save_cube(&cube, &spec(), &data_path, &header_path).unwrap();
            pairs.push((data_path, header_path));
        }
        let stacked = load_stacked(&pairs).unwrap();
        assert_eq!(stacked.n_channels(), 8);
        assert_eq!(stacked.data()[[5, 0, 0]], 1.0);
    }

    #[test]
    fn missing_header_is_an_io_error() {
        let err = read_header(Path::new("/nonexistent/cube.json")).unwrap_err();
        assert!(matches!(err, CubeError::Io { .. }));
        assert_eq!(err.exit_code(), 4);
    }
}
