//! Shared domain types: spectral units, the spectral axis and header cards.
//!
//! These are kept serializable so they can be read from the JSON header that
//! accompanies a `.npy` cube and echoed back into exported reports.

use std::collections::BTreeMap;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::CubeError;

/// Speed of light in m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Header card holding the noise level of the cube.
pub const RMS_LEVEL_CARD: &str = "RMSLVL";

/// Unit of the spectral axis, or of channel ranges given by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum SpectralUnit {
    /// Raw channel index.
    #[serde(rename = "channel", alias = "pixel", alias = "pix", alias = "chan")]
    #[value(name = "channel", alias = "pixel")]
    Channel,
    #[serde(rename = "Hz")]
    #[value(name = "Hz")]
    Hz,
    #[serde(rename = "kHz")]
    #[value(name = "kHz")]
    KHz,
    #[serde(rename = "MHz")]
    #[value(name = "MHz")]
    MHz,
    #[serde(rename = "GHz")]
    #[value(name = "GHz")]
    GHz,
    #[serde(rename = "m/s")]
    #[value(name = "m/s")]
    MetersPerSecond,
    #[serde(rename = "km/s", alias = "km s-1")]
    #[value(name = "km/s")]
    KilometersPerSecond,
}

/// Physical quantity behind a [`SpectralUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Channel,
    Frequency,
    Velocity,
}

impl SpectralUnit {
    pub fn kind(self) -> UnitKind {
        match self {
            SpectralUnit::Channel => UnitKind::Channel,
            SpectralUnit::Hz | SpectralUnit::KHz | SpectralUnit::MHz | SpectralUnit::GHz => {
                UnitKind::Frequency
            }
            SpectralUnit::MetersPerSecond | SpectralUnit::KilometersPerSecond => {
                UnitKind::Velocity
            }
        }
    }

    /// Multiplier taking a value in this unit to Hz (frequency) or m/s (velocity).
    pub fn si_scale(self) -> f64 {
        match self {
            SpectralUnit::Channel | SpectralUnit::Hz | SpectralUnit::MetersPerSecond => 1.0,
            SpectralUnit::KHz | SpectralUnit::KilometersPerSecond => 1e3,
            SpectralUnit::MHz => 1e6,
            SpectralUnit::GHz => 1e9,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SpectralUnit::Channel => "channel",
            SpectralUnit::Hz => "Hz",
            SpectralUnit::KHz => "kHz",
            SpectralUnit::MHz => "MHz",
            SpectralUnit::GHz => "GHz",
            SpectralUnit::MetersPerSecond => "m/s",
            SpectralUnit::KilometersPerSecond => "km/s",
        }
    }
}

/// Doppler convention relating frequency and velocity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VelocityConvention {
    Radio,
    Optical,
    Relativistic,
}

impl VelocityConvention {
    /// Velocity (m/s) of a frequency (Hz) relative to `rest` (Hz).
    pub fn frequency_to_velocity(self, freq: f64, rest: f64) -> f64 {
        match self {
            VelocityConvention::Radio => SPEED_OF_LIGHT * (1.0 - freq / rest),
            VelocityConvention::Optical => SPEED_OF_LIGHT * (rest / freq - 1.0),
            VelocityConvention::Relativistic => {
                let (f2, r2) = (freq * freq, rest * rest);
                SPEED_OF_LIGHT * (r2 - f2) / (r2 + f2)
            }
        }
    }

    /// Frequency (Hz) of a velocity (m/s) relative to `rest` (Hz).
    pub fn velocity_to_frequency(self, velocity: f64, rest: f64) -> f64 {
        let beta = velocity / SPEED_OF_LIGHT;
        match self {
            VelocityConvention::Radio => rest * (1.0 - beta),
            VelocityConvention::Optical => rest / (1.0 + beta),
            VelocityConvention::Relativistic => rest * ((1.0 - beta) / (1.0 + beta)).sqrt(),
        }
    }
}

/// Serializable description of a linear spectral axis (FITS-style WCS).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralAxisSpec {
    pub crval: f64,
    pub cdelt: f64,
    /// 1-based reference channel.
    pub crpix: f64,
    pub unit: SpectralUnit,
    #[serde(default)]
    pub convention: Option<VelocityConvention>,
    /// Rest frequency in Hz.
    #[serde(default)]
    pub rest_frequency: Option<f64>,
}

/// Channel-to-physical-value mapping of a cube.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralAxis {
    values: Vec<f64>,
    unit: SpectralUnit,
    convention: Option<VelocityConvention>,
    rest_frequency: Option<f64>,
}

impl SpectralAxis {
    pub fn new(values: Vec<f64>, unit: SpectralUnit) -> Result<Self, CubeError> {
        if values.is_empty() {
            return Err(CubeError::InvalidShape("Spectral axis has no channels.".into()));
        }
        Ok(Self {
            values,
            unit,
            convention: None,
            rest_frequency: None,
        })
    }

    /// Build an `n`-channel axis from a linear WCS description.
    pub fn from_spec(n: usize, spec: &SpectralAxisSpec) -> Result<Self, CubeError> {
        if !(spec.crval.is_finite() && spec.cdelt.is_finite() && spec.crpix.is_finite()) {
            return Err(CubeError::InvalidInput(
                "Spectral axis WCS values must be finite.".into(),
            ));
        }
        let values = (0..n)
            .map(|i| spec.crval + (i as f64 + 1.0 - spec.crpix) * spec.cdelt)
            .collect();
        let mut axis = Self::new(values, spec.unit)?;
        axis.convention = spec.convention;
        axis.rest_frequency = spec.rest_frequency;
        Ok(axis)
    }

    pub fn with_convention(mut self, convention: VelocityConvention) -> Self {
        self.convention = Some(convention);
        self
    }

    /// Set the rest frequency, in Hz.
    pub fn with_rest_frequency(mut self, hz: f64) -> Self {
        self.rest_frequency = Some(hz);
        self
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn unit(&self) -> SpectralUnit {
        self.unit
    }

    pub fn convention(&self) -> Option<VelocityConvention> {
        self.convention
    }

    pub fn rest_frequency(&self) -> Option<f64> {
        self.rest_frequency
    }

    /// The axis values expressed in `target` units.
    pub fn to_unit(&self, target: SpectralUnit) -> Result<Vec<f64>, CubeError> {
        if target == SpectralUnit::Channel {
            return Ok((0..self.len()).map(|i| i as f64).collect());
        }
        self.values
            .iter()
            .map(|&v| self.convert(v, self.unit, target))
            .collect()
    }

    /// Index of the channel closest to `value` (given in `unit`).
    pub fn x_to_pix(&self, value: f64, unit: SpectralUnit) -> Result<usize, CubeError> {
        if !value.is_finite() {
            return Err(CubeError::InvalidInput(format!(
                "Channel boundary must be finite, got {value}."
            )));
        }
        if unit == SpectralUnit::Channel {
            let idx = value.round().max(0.0) as usize;
            return Ok(idx.min(self.len()));
        }
        let converted = self.to_unit(unit)?;
        let mut best = 0usize;
        let mut best_dist = f64::INFINITY;
        for (i, &x) in converted.iter().enumerate() {
            let dist = (x - value).abs();
            if dist < best_dist {
                best = i;
                best_dist = dist;
            }
        }
        Ok(best)
    }

    fn convert(&self, value: f64, from: SpectralUnit, to: SpectralUnit) -> Result<f64, CubeError> {
        let si = value * from.si_scale();
        match (from.kind(), to.kind()) {
            (a, b) if a == b => Ok(si / to.si_scale()),
            (UnitKind::Frequency, UnitKind::Velocity) => {
                let (convention, rest) = self.doppler(from, to)?;
                Ok(convention.frequency_to_velocity(si, rest) / to.si_scale())
            }
            (UnitKind::Velocity, UnitKind::Frequency) => {
                let (convention, rest) = self.doppler(from, to)?;
                Ok(convention.velocity_to_frequency(si, rest) / to.si_scale())
            }
            _ => Err(CubeError::UnitConversion {
                from: from.label().into(),
                to: to.label().into(),
                hint: "channel indices have no physical value; give ranges in channels instead"
                    .into(),
            }),
        }
    }

    fn doppler(
        &self,
        from: SpectralUnit,
        to: SpectralUnit,
    ) -> Result<(VelocityConvention, f64), CubeError> {
        let missing = |what: &str| CubeError::UnitConversion {
            from: from.label().into(),
            to: to.label().into(),
            hint: format!(
                "the spectral axis has no {what}. Consider setting, e.g., \
                 `convention: radio` and `rest_frequency: <line frequency in Hz>` \
                 in the cube header."
            ),
        };
        let convention = self.convention.ok_or_else(|| missing("velocity convention"))?;
        let rest = self
            .rest_frequency
            .filter(|r| r.is_finite() && *r > 0.0)
            .ok_or_else(|| missing("rest frequency"))?;
        Ok((convention, rest))
    }
}

/// A single header card value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

/// Key/value metadata carried alongside the cube.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CubeHeader {
    cards: BTreeMap<String, HeaderValue>,
}

impl CubeHeader {
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.cards.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.cards.get(key) {
            Some(HeaderValue::Number(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: HeaderValue) {
        self.cards.insert(key.into(), value);
    }

    pub fn rms_level(&self) -> Option<f64> {
        self.get_f64(RMS_LEVEL_CARD)
    }

    pub fn set_rms_level(&mut self, rms: f64) {
        self.set(RMS_LEVEL_CARD, HeaderValue::Number(rms));
    }

    /// Add cards from `other` that are not present here.
    pub fn merge_missing(&mut self, other: &CubeHeader) {
        for (k, v) in &other.cards {
            self.cards.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn velocity_axis() -> SpectralAxis {
        SpectralAxis::from_spec(
            10,
            &SpectralAxisSpec {
                crval: 5.0,
                cdelt: -0.1,
                crpix: 5.0,
                unit: SpectralUnit::KilometersPerSecond,
                convention: None,
                rest_frequency: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn linear_wcs_uses_one_based_reference_pixel() {
        let axis = velocity_axis();
        assert!((axis.values()[4] - 5.0).abs() < 1e-12);
        assert!((axis.values()[0] - 5.4).abs() < 1e-12);
    }

    #[test]
    fn same_kind_conversion_scales() {
        let axis = velocity_axis();
        let ms = axis.to_unit(SpectralUnit::MetersPerSecond).unwrap();
        assert!((ms[4] - 5000.0).abs() < 1e-9);
    }

    #[test]
    fn x_to_pix_handles_descending_axis() {
        let axis = velocity_axis();
        assert_eq!(axis.x_to_pix(4.98, SpectralUnit::KilometersPerSecond).unwrap(), 4);
        assert_eq!(axis.x_to_pix(5000.0, SpectralUnit::MetersPerSecond).unwrap(), 4);
    }

    #[test]
    fn velocity_to_frequency_needs_convention_and_rest_frequency() {
        let axis = velocity_axis();
        let err = axis.to_unit(SpectralUnit::GHz).unwrap_err();
        assert!(matches!(err, CubeError::UnitConversion { .. }));
        assert!(err.to_string().contains("convention"));

        let axis = velocity_axis().with_convention(VelocityConvention::Radio);
        let err = axis.to_unit(SpectralUnit::GHz).unwrap_err();
        assert!(err.to_string().contains("rest frequency"));

        let axis = axis.with_rest_frequency(23.694_495_5e9);
        let ghz = axis.to_unit(SpectralUnit::GHz).unwrap();
        assert!(ghz.iter().all(|f| (f - 23.6945).abs() < 1e-3));
    }

    #[test]
    fn doppler_conventions_invert() {
        let rest = 1.0e11;
        for conv in [
            VelocityConvention::Radio,
            VelocityConvention::Optical,
            VelocityConvention::Relativistic,
        ] {
            let f = conv.velocity_to_frequency(12_345.0, rest);
            let v = conv.frequency_to_velocity(f, rest);
            assert!((v - 12_345.0).abs() < 1e-6, "{conv:?}: {v}");
        }
    }

    #[test]
    fn header_reads_rms_card() {
        let header: CubeHeader =
            serde_json::from_str(r#"{"RMSLVL": 0.25, "BUNIT": "K", "CHECKED": true}"#).unwrap();
        assert_eq!(header.rms_level(), Some(0.25));
        assert_eq!(header.get("BUNIT"), Some(&HeaderValue::Text("K".into())));
    }
}
