//! Output record assembly.
//!
//! Readings extracted from one frame are folded into a [`FrameRecord`]: a
//! named, ordered list of channels that stays schema-stable for a given
//! configuration. Readings sharing a region name are grouped across elements
//! (first appearance wins the position) into one channel per name, followed
//! by the aggregate channels:
//!
//! - `FF`, the fluorescence-equivalent sum of every contributing reading;
//! - `FF_bad` in Threshold mode, the bad-stream counterpart;
//! - `resgrade_sums` in All16 mode, cumulative grade sums over all regions;
//! - `allElementSum`, the optional summed spectrum of full-spectrum runs;
//! - the optional raw hardware scaler passthrough channels.
//!
//! Every channel is tagged with the `"counts"` unit.

use ndarray::{Array2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::config::{DetectorConfiguration, RegionKind, ResolutionGradeMode, NUM_GRADES};
use crate::extract::Reading;
use crate::unpack::{
    ScalerFrames, WORD_CLOCK_CYCLES, WORD_IN_WINDOW, WORD_RESETS, WORD_TOTAL_EVENTS,
};

/// Unit tag shared by every output channel.
pub const COUNTS_UNIT: &str = "counts";

/// Name of the fluorescence-equivalent aggregate channel.
pub const FF_CHANNEL: &str = "FF";
/// Name of the bad-stream aggregate channel (Threshold mode).
pub const FF_BAD_CHANNEL: &str = "FF_bad";
/// Name of the cumulative grade aggregate channel (All16 mode).
pub const RESGRADE_SUMS_CHANNEL: &str = "resgrade_sums";
/// Name of the optional summed-spectrum channel.
pub const ALL_ELEMENT_SUM_CHANNEL: &str = "allElementSum";
/// Name of the per-element corrected in-window channel of the scaler-only
/// readout path.
pub const SCALERS_CHANNEL: &str = "scalers";

/// Names of the raw scaler passthrough channels, in emission order.
pub const RAW_SCALER_CHANNELS: [&str; 4] = [
    "raw scaler total",
    "tfg resets",
    "raw scaler in-window",
    "tfg clock cycles",
];

// ===== Output options =====

/// Optional output channels and correction toggles for a reduction run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct OutputOptions {
    /// Suppress deadtime correction so raw spectra can be persisted. Every
    /// per-element factor is forced to `1.0` for the whole readout.
    #[serde(default)]
    pub save_raw_spectrum: bool,
    /// Emit the `allElementSum` channel. Only honored for full-spectrum
    /// region configurations, where the whole spectrum is available.
    #[serde(default)]
    pub sum_all_elements: bool,
    /// Emit the four raw hardware scaler channels per element.
    #[serde(default)]
    pub raw_scaler_channels: bool,
}

// ===== Channels =====

/// Value payload of one output channel.
#[derive(Clone, Debug, Serialize)]
pub enum ChannelValue {
    /// A single aggregate number.
    Scalar(f64),
    /// One value per element, in element order.
    Elements(Vec<f64>),
    /// Sixteen cumulative grade values per element, in element order.
    ElementGrades(Vec<Vec<f64>>),
    /// One `[grade][bin]` block per element, in element order.
    ElementSpectra(Vec<Array2<f64>>),
    /// A single spectrum summed over elements.
    Spectrum(Vec<f64>),
    /// One raw hardware word per element, in element order.
    ElementsRaw(Vec<u32>),
}

impl ChannelValue {
    /// The scalar payload, if this is a scalar channel.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ChannelValue::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    /// The per-element values, if this is a per-element scalar channel.
    pub fn as_elements(&self) -> Option<&[f64]> {
        match self {
            ChannelValue::Elements(values) => Some(values),
            _ => None,
        }
    }

    /// The per-element grade vectors, if present.
    pub fn as_element_grades(&self) -> Option<&[Vec<f64>]> {
        match self {
            ChannelValue::ElementGrades(values) => Some(values),
            _ => None,
        }
    }

    /// The per-element spectrum blocks, if present.
    pub fn as_element_spectra(&self) -> Option<&[Array2<f64>]> {
        match self {
            ChannelValue::ElementSpectra(values) => Some(values),
            _ => None,
        }
    }

    /// The summed spectrum, if this is a summed-spectrum channel.
    pub fn as_spectrum(&self) -> Option<&[f64]> {
        match self {
            ChannelValue::Spectrum(values) => Some(values),
            _ => None,
        }
    }

    /// The raw per-element words, if this is a passthrough channel.
    pub fn as_elements_raw(&self) -> Option<&[u32]> {
        match self {
            ChannelValue::ElementsRaw(values) => Some(values),
            _ => None,
        }
    }
}

/// One named output channel of a frame record.
#[derive(Clone, Debug, Serialize)]
pub struct Channel {
    /// Channel name, stable across frames for a configuration.
    pub name: String,
    /// Physical unit tag.
    pub unit: String,
    /// Channel payload.
    pub value: ChannelValue,
}

impl Channel {
    /// Channel carrying a counts-unit payload.
    pub fn counts(name: impl Into<String>, value: ChannelValue) -> Self {
        Channel {
            name: name.into(),
            unit: COUNTS_UNIT.to_string(),
            value,
        }
    }
}

/// Corrected, named output of one frame.
#[derive(Clone, Debug, Serialize)]
pub struct FrameRecord {
    /// Frame index within the readout call.
    pub frame: usize,
    /// Channels in schema order.
    pub channels: Vec<Channel>,
}

impl FrameRecord {
    /// Look up a channel by name.
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Channel names in schema order.
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name.as_str()).collect()
    }

    /// Scalar payload of a named channel, if it exists and is scalar.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.channel(name).and_then(|c| c.value.as_scalar())
    }
}

// ===== Assembly =====

/// Assemble the output record of one frame from its readings.
///
/// `spectra` is the frame's `[element][grade][bin]` view and `factors` the
/// per-element deadtime factors; both are needed only for the optional
/// aggregate channels.
#[allow(clippy::too_many_arguments)]
pub fn assemble_frame(
    frame_index: usize,
    readings: &[Reading],
    config: &DetectorConfiguration,
    options: &OutputOptions,
    scalers: &ScalerFrames,
    spectra: ArrayView3<'_, u32>,
    factors: &[f64],
    incident_flux: Option<f64>,
) -> FrameRecord {
    let mode = config.grade_mode;
    let mut channels = Vec::new();

    for (name, members) in group_readings(readings) {
        channels.push(group_channel(name, &members));
    }

    let ff: f64 = readings
        .iter()
        .filter(|r| r.contributes_to_ff())
        .map(|r| r.ff_value(mode))
        .sum();
    channels.push(Channel::counts(FF_CHANNEL, ChannelValue::Scalar(ff)));

    if mode == ResolutionGradeMode::Threshold {
        let ff_bad: f64 = readings.iter().map(Reading::ff_bad_value).sum();
        channels.push(Channel::counts(FF_BAD_CHANNEL, ChannelValue::Scalar(ff_bad)));
    }

    if mode == ResolutionGradeMode::All16 {
        channels.push(Channel::counts(
            RESGRADE_SUMS_CHANNEL,
            ChannelValue::Spectrum(resolution_grade_sums(readings, incident_flux)),
        ));
    }

    if options.sum_all_elements && config.region_kind() == Some(RegionKind::FullSpectrum) {
        channels.push(Channel::counts(
            ALL_ELEMENT_SUM_CHANNEL,
            ChannelValue::Spectrum(all_element_sum(config, spectra, factors)),
        ));
    }

    if options.raw_scaler_channels {
        channels.extend(raw_scaler_channels(scalers, frame_index));
    }

    FrameRecord {
        frame: frame_index,
        channels,
    }
}

/// The four raw hardware scaler passthrough channels of one frame.
pub(crate) fn raw_scaler_channels(scalers: &ScalerFrames, frame: usize) -> Vec<Channel> {
    let raw = scalers.frame_raw(frame);
    RAW_SCALER_CHANNELS
        .iter()
        .zip([
            WORD_TOTAL_EVENTS,
            WORD_RESETS,
            WORD_IN_WINDOW,
            WORD_CLOCK_CYCLES,
        ])
        .map(|(name, word)| {
            Channel::counts(
                *name,
                ChannelValue::ElementsRaw(raw.index_axis(Axis(1), word).to_vec()),
            )
        })
        .collect()
}

/// Group readings by region name, preserving first-appearance order.
fn group_readings(readings: &[Reading]) -> Vec<(&str, Vec<&Reading>)> {
    let mut groups: Vec<(&str, Vec<&Reading>)> = Vec::new();
    for reading in readings {
        match groups
            .iter_mut()
            .find(|(name, _)| *name == reading.roi_name())
        {
            Some((_, members)) => members.push(reading),
            None => groups.push((reading.roi_name(), vec![reading])),
        }
    }
    groups
}

/// Build the channel for one region-name group.
///
/// Groups are shape-uniform: every member came from the same region kind and
/// grade mode, so the first member decides the payload layout.
fn group_channel(name: &str, members: &[&Reading]) -> Channel {
    match members {
        [Reading::Window { counts, .. }, ..] if counts.len() == 1 => {
            let values = members
                .iter()
                .map(|r| match r {
                    Reading::Window { counts, .. } => counts.first().copied().unwrap_or(0.0),
                    Reading::Spectrum { peak_area, .. } => *peak_area,
                })
                .collect();
            Channel::counts(name, ChannelValue::Elements(values))
        }
        [Reading::Window { .. }, ..] => {
            let values = members
                .iter()
                .map(|r| match r {
                    Reading::Window { counts, .. } => counts.clone(),
                    Reading::Spectrum { .. } => Vec::new(),
                })
                .collect();
            Channel::counts(name, ChannelValue::ElementGrades(values))
        }
        _ => {
            let values = members
                .iter()
                .filter_map(|r| match r {
                    Reading::Spectrum { counts, .. } => Some(counts.clone()),
                    Reading::Window { .. } => None,
                })
                .collect();
            Channel::counts(name, ChannelValue::ElementSpectra(values))
        }
    }
}

/// Cumulative grade sums over every reading of an All16 frame.
///
/// Window counts are already cumulative (and flux normalized) from
/// extraction; spectrum blocks contribute their per-grade totals summed
/// cumulatively, normalized here under the same flux guard.
fn resolution_grade_sums(readings: &[Reading], incident_flux: Option<f64>) -> Vec<f64> {
    let mut bins = vec![0.0; NUM_GRADES];
    let mut spectrum_part = vec![0.0; NUM_GRADES];

    for reading in readings {
        match reading {
            Reading::Window { counts, .. } => {
                for (bin, count) in counts.iter().enumerate().take(NUM_GRADES) {
                    bins[bin] += count;
                }
            }
            Reading::Spectrum { counts, .. } => {
                // Rows are presented best grade first, so a running sum over
                // rows yields exactly the cumulative grade bins.
                let mut accumulated = 0.0;
                for (bin, row) in counts.rows().into_iter().enumerate().take(NUM_GRADES) {
                    accumulated += row.sum();
                    spectrum_part[bin] += accumulated;
                }
            }
        }
    }

    if let Some(flux) = incident_flux {
        if flux.is_finite() && flux > 0.0 {
            for value in &mut spectrum_part {
                *value /= flux;
            }
        }
    }
    for (bin, value) in spectrum_part.iter().enumerate() {
        bins[bin] += value;
    }
    bins
}

/// Element-wise sum of every non-excluded element's corrected spectrum.
fn all_element_sum(
    config: &DetectorConfiguration,
    spectra: ArrayView3<'_, u32>,
    factors: &[f64],
) -> Vec<f64> {
    let mut sum = vec![0.0; config.spectrum_size];
    for (index, element) in config.elements.iter().enumerate() {
        if element.excluded {
            continue;
        }
        for row in spectra.index_axis(Axis(0), index).rows() {
            for (bin, &value) in row.iter().enumerate() {
                sum[bin] += f64::from(value) * factors[index];
            }
        }
    }
    sum
}

// ===== Tests =====
