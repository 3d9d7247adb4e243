//! Signal and noise estimation.
//!
//! - `rms_map`: population standard deviation over the noise channels
//! - `signal_map`: maximum over the signal channels
//! - `snr_map`: `signal_map / rms_map`
//!
//! Channel regions come from explicit masks, from ranges given in any
//! spectral unit the cube's axis can convert to, or from the rule of thirds:
//! outer thirds are noise, the inner third is signal.

use ndarray::{Array2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::domain::{SpectralAxis, SpectralCube, SpectralUnit};
use crate::error::CubeError;

/// Fraction of the band taken by each outer third.
pub const DEFAULT_THIRDS_CUT: f64 = 0.33;

/// A spectral interval; the order of the ends does not matter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub low: f64,
    pub high: f64,
}

impl ChannelRange {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }
}

/// Boolean channel mask from ranges given in `unit`.
///
/// Each range covers `[lo, hi)` in channel indices after sorting its ends, so
/// axes running backwards work too.
pub fn channel_mask(xarr: &SpectralAxis, ranges: &[ChannelRange], unit: SpectralUnit) -> Result<Vec<bool>, CubeError> {
    let n = xarr.len();
    let mut mask = vec![false; n];
    for range in ranges {
        let a = xarr.x_to_pix(range.low, unit)?;
        let b = xarr.x_to_pix(range.high, unit)?;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        mask[lo.min(n)..hi.min(n)].iter_mut().for_each(|m| *m = true);
    }
    Ok(mask)
}

/// Rule-of-thirds ranges in channels: `(signal, noise)`.
///
/// Bands too short for a non-empty inner third use the middle channel as signal.
pub fn default_thirds(n_channels: usize) -> (Vec<ChannelRange>, Vec<ChannelRange>) {
    let n = n_channels as f64;
    let lo = (n * DEFAULT_THIRDS_CUT).round_ties_even();
    let hi = (n * (1.0 - DEFAULT_THIRDS_CUT)).round_ties_even();
    let signal = if hi - lo > 2.0 {
        vec![ChannelRange::new(lo + 1.0, hi - 1.0)]
    } else {
        let mid = (n_channels / 2) as f64;
        vec![ChannelRange::new(mid, mid + 1.0)]
    };
    let noise = vec![ChannelRange::new(0.0, lo), ChannelRange::new(hi, n - 1.0)];
    (signal, noise)
}

/// Per-pixel RMS over the masked channels; all channels when `mask` is `None`.
pub fn rms_map(cube: ArrayView3<'_, f64>, noise_mask: Option<&[bool]>) -> Result<Array2<f64>, CubeError> {
    if noise_mask.is_none() {
        log::warn!(
            "no noise mask was given, will calculate the RMS over all channels, \
             thus overestimating the noise!"
        );
    }
    let selected = select_channels(cube, noise_mask, "noise")?;
    Ok(cube.select(Axis(0), &selected).std_axis(Axis(0), 0.0))
}

/// Per-pixel maximum over the masked channels; all channels when `mask` is
/// `None`. A NaN channel makes the pixel NaN.
pub fn signal_map(cube: ArrayView3<'_, f64>, signal_mask: Option<&[bool]>) -> Result<Array2<f64>, CubeError> {
    if signal_mask.is_none() {
        log::warn!(
            "no signal mask was given, will calculate the signal over all channels: \
             true signal might be lower."
        );
    }
    let selected = select_channels(cube, signal_mask, "signal")?;
    let (_, ny, nx) = cube.dim();
    let mut out = Array2::from_elem((ny, nx), f64::NEG_INFINITY);
    for &c in &selected {
        ndarray::Zip::from(&mut out)
            .and(&cube.index_axis(Axis(0), c))
            .for_each(|m, &v| {
                if v.is_nan() || m.is_nan() {
                    *m = f64::NAN;
                } else if v > *m {
                    *m = v;
                }
            });
    }
    Ok(out)
}

fn select_channels(cube: ArrayView3<'_, f64>, mask: Option<&[bool]>, what: &str) -> Result<Vec<usize>, CubeError> {
    let n = cube.dim().0;
    let Some(mask) = mask else {
        return Ok((0..n).collect());
    };
    if mask.len() != n {
        return Err(CubeError::InvalidShape(format!(
            "The {what} mask has {} entries for {n} channels.",
            mask.len()
        )));
    }
    let selected: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(i, &m)| m.then_some(i))
        .collect();
    if selected.is_empty() {
        return Err(CubeError::InvalidInput(format!("The {what} mask selects no channels.")));
    }
    Ok(selected)
}

/// Where to look for signal and noise.
///
/// Masks override ranges. Without either, the rule of thirds is used.
#[derive(Debug, Clone, PartialEq)]
pub struct SnrRequest {
    pub signal: Option<Vec<ChannelRange>>,
    pub noise: Option<Vec<ChannelRange>>,
    /// Unit of `signal` / `noise` ranges.
    pub unit: SpectralUnit,
    pub signal_mask: Option<Vec<bool>>,
    pub noise_mask: Option<Vec<bool>>,
}

impl Default for SnrRequest {
    fn default() -> Self {
        Self {
            signal: None,
            noise: None,
            unit: SpectralUnit::KilometersPerSecond,
            signal_mask: None,
            noise_mask: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalNoise {
    pub signal_mask: Vec<bool>,
    pub noise_mask: Vec<bool>,
    pub rms_map: Array2<f64>,
    pub signal_map: Array2<f64>,
    pub snr_map: Array2<f64>,
}

/// Compute the signal, noise and SNR maps of a cube.
pub fn estimate_snr(cube: &SpectralCube, req: &SnrRequest) -> Result<SignalNoise, CubeError> {
    let xarr = cube.xarr();
    let (thirds_signal, thirds_noise) = default_thirds(cube.n_channels());

    let signal_mask = match (&req.signal_mask, &req.signal) {
        (Some(mask), _) => mask.clone(),
        (None, Some(ranges)) => channel_mask(xarr, ranges, req.unit)?,
        (None, None) => {
            log::warn!(
                "No signal channels given; using the inner third of the band. \
                 This misjudges off-center lines."
            );
            channel_mask(xarr, &thirds_signal, SpectralUnit::Channel)?
        }
    };
    let noise_mask = match (&req.noise_mask, &req.noise) {
        (Some(mask), _) => mask.clone(),
        (None, Some(ranges)) => channel_mask(xarr, ranges, req.unit)?,
        (None, None) => {
            log::warn!(
                "No noise channels given; using the outer thirds of the band. \
                 This misjudges off-center lines."
            );
            channel_mask(xarr, &thirds_noise, SpectralUnit::Channel)?
        }
    };

    let signal_map = signal_map(cube.data(), Some(&signal_mask))?;
    let rms_map = rms_map(cube.data(), Some(&noise_mask))?;
    let snr_map = &signal_map / &rms_map;
    log::info!(
        "SNR map computed from {} signal and {} noise channels",
        signal_mask.iter().filter(|&&m| m).count(),
        noise_mask.iter().filter(|&&m| m).count()
    );

    Ok(SignalNoise {
        signal_mask,
        noise_mask,
        rms_map,
        signal_map,
        snr_map,
    })
}
