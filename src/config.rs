//! Detector configuration model.
//!
//! Everything the engine needs to know about the detector is collected into a
//! single immutable [`DetectorConfiguration`] value: element count and order,
//! the resolution-grade readout mode, per-element regions of interest and
//! deadtime calibration, and the delivered spectrum geometry. The value is
//! built either programmatically or from a TOML file, validated once up
//! front, and then passed by reference into the pure reduction functions.
//!
//! Validation is all-or-nothing. A configuration that fails any check is
//! rejected before a single frame is unpacked, so downstream code can index
//! regions and elements without re-checking bounds.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReduceError, ReduceResult};

// ===== Resolution grades =====

/// Resolution-grade readout mode of the detector.
///
/// The grade of an event measures how cleanly the pulse processor resolved
/// it; the hardware can fold grades together or report them individually,
/// and the chosen mode fixes how many grade rows each element delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionGradeMode {
    /// Events are not graded; one row per element.
    None,
    /// Events are split at a grade threshold into bad (row 0) and good
    /// (row 1) streams; two rows per element.
    Threshold,
    /// Every hardware grade is reported individually; sixteen rows per
    /// element, row index equal to grade.
    All16,
}

impl ResolutionGradeMode {
    /// Number of grade rows delivered per element in this mode.
    pub fn grade_count(self) -> usize {
        match self {
            ResolutionGradeMode::None => 1,
            ResolutionGradeMode::Threshold => 2,
            ResolutionGradeMode::All16 => 16,
        }
    }
}

/// Number of hardware resolution grades.
pub const NUM_GRADES: usize = 16;

// ===== Regions of interest =====

/// How a region's counts are delivered inside the spectrum row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    /// The hardware sums the window into a single slot; regions occupy
    /// consecutive slots in declaration order.
    VirtualScalar,
    /// The window's bins are delivered individually, packed back to back in
    /// declaration order.
    PartialSpectrum,
    /// The full spectrum is delivered and the window indexes it directly.
    FullSpectrum,
}

/// A named energy window on one detector element.
///
/// Windows with the same name on different elements are grouped into one
/// output channel, so names are the cross-element identity of a region.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionOfInterest {
    /// Channel name this region contributes to.
    pub name: String,
    /// First bin of the window (inclusive).
    pub start_bin: usize,
    /// Last bin of the window (inclusive).
    pub end_bin: usize,
    /// Delivery layout of the window's counts.
    pub kind: RegionKind,
}

impl RegionOfInterest {
    /// Number of bins the window covers.
    pub fn width(&self) -> usize {
        self.end_bin - self.start_bin + 1
    }
}

// ===== Deadtime calibration =====

/// Pileup calibration for one element.
///
/// The process dead times may carry an energy dependence; the gradient terms
/// are applied only when a working energy is configured and the gradient is
/// non-zero, otherwise the offsets are used alone.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DeadtimeCalibration {
    /// Process dead time for all detected events, seconds.
    pub all_event_offset: f64,
    /// Energy gradient of the all-event dead time, seconds per keV.
    #[serde(default)]
    pub all_event_gradient: f64,
    /// Process dead time for in-window events, seconds.
    pub in_window_offset: f64,
    /// Energy gradient of the in-window dead time, seconds per keV.
    #[serde(default)]
    pub in_window_gradient: f64,
}

impl DeadtimeCalibration {
    /// All-event process dead time at the given working energy.
    pub fn all_event_dead_time(&self, energy: Option<f64>) -> f64 {
        energy_dependent(self.all_event_offset, self.all_event_gradient, energy)
    }

    /// In-window process dead time at the given working energy.
    pub fn in_window_dead_time(&self, energy: Option<f64>) -> f64 {
        energy_dependent(self.in_window_offset, self.in_window_gradient, energy)
    }
}

fn energy_dependent(offset: f64, gradient: f64, energy: Option<f64>) -> f64 {
    match energy {
        Some(e) if e > 0.0 && gradient != 0.0 => offset + gradient * e,
        _ => offset,
    }
}

// ===== Elements =====

/// One physical detector element and its readout description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectorElement {
    /// Position of the element in the hardware readout order.
    pub index: usize,
    /// Excluded elements stay in the readout stream but contribute zero to
    /// every output and skip deadtime computation.
    #[serde(default)]
    pub excluded: bool,
    /// Regions of interest configured on this element.
    #[serde(default)]
    pub regions: Vec<RegionOfInterest>,
    /// Pileup calibration of this element.
    #[serde(default)]
    pub calibration: DeadtimeCalibration,
}

// ===== Configuration =====

/// Immutable description of the whole detector for one acquisition run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectorConfiguration {
    /// Detector elements in hardware readout order.
    pub elements: Vec<DetectorElement>,
    /// Bins per grade row as delivered by the hardware stream.
    pub spectrum_size: usize,
    /// Resolution-grade readout mode.
    pub grade_mode: ResolutionGradeMode,
    /// Working energy for the calibration gradient terms, keV.
    #[serde(default)]
    pub deadtime_energy: Option<f64>,
}

impl DetectorConfiguration {
    /// Load and validate a configuration from a TOML file.
    pub fn from_toml_path<P: AsRef<Path>>(path: P) -> ReduceResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> ReduceResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of detector elements.
    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }

    /// The single region kind used across the configuration, if any region
    /// is configured at all. Mixed kinds are rejected by [`validate`].
    ///
    /// [`validate`]: DetectorConfiguration::validate
    pub fn region_kind(&self) -> Option<RegionKind> {
        self.elements
            .iter()
            .flat_map(|e| e.regions.iter())
            .map(|r| r.kind)
            .next()
    }

    /// Check every invariant the reduction code relies on.
    ///
    /// Ordering matters only for error reporting; the first violated check
    /// wins. On success the configuration is usable for any number of
    /// readout calls.
    pub fn validate(&self) -> ReduceResult<()> {
        if self.elements.is_empty() {
            return Err(ReduceError::Configuration(
                "configuration must declare at least one detector element".into(),
            ));
        }
        if self.spectrum_size == 0 {
            return Err(ReduceError::Configuration(
                "spectrum_size must be at least 1".into(),
            ));
        }
        if let Some(energy) = self.deadtime_energy {
            if !energy.is_finite() {
                return Err(ReduceError::Configuration(format!(
                    "deadtime_energy must be finite, got {energy}"
                )));
            }
        }

        let uniform_kind = self.region_kind();
        for (position, element) in self.elements.iter().enumerate() {
            if element.index != position {
                return Err(ReduceError::Configuration(format!(
                    "element at position {position} declares index {}; elements must be listed in index order",
                    element.index
                )));
            }
            self.validate_calibration(element)?;
            self.validate_regions(element, uniform_kind)?;
            let required = self.required_readout_width(element);
            if element.regions.first().map(|r| r.kind) != Some(RegionKind::FullSpectrum)
                && required > self.spectrum_size
            {
                return Err(ReduceError::Configuration(format!(
                    "element {} needs a readout width of {required} but the spectrum has only {} bins",
                    element.index, self.spectrum_size
                )));
            }
        }
        Ok(())
    }

    fn validate_calibration(&self, element: &DetectorElement) -> ReduceResult<()> {
        let calib = &element.calibration;
        let terms = [
            ("all_event_offset", calib.all_event_offset),
            ("all_event_gradient", calib.all_event_gradient),
            ("in_window_offset", calib.in_window_offset),
            ("in_window_gradient", calib.in_window_gradient),
        ];
        for (field, value) in terms {
            if !value.is_finite() {
                return Err(ReduceError::Configuration(format!(
                    "element {}: calibration {field} must be finite, got {value}",
                    element.index
                )));
            }
        }
        if calib.all_event_offset < 0.0 || calib.in_window_offset < 0.0 {
            return Err(ReduceError::Configuration(format!(
                "element {}: calibration dead-time offsets must not be negative",
                element.index
            )));
        }
        Ok(())
    }

    fn validate_regions(
        &self,
        element: &DetectorElement,
        uniform_kind: Option<RegionKind>,
    ) -> ReduceResult<()> {
        for (i, region) in element.regions.iter().enumerate() {
            if region.name.is_empty() {
                return Err(ReduceError::Configuration(format!(
                    "element {}: region {i} has an empty name",
                    element.index
                )));
            }
            if region.start_bin > region.end_bin {
                return Err(ReduceError::Configuration(format!(
                    "element {}: region '{}' has start_bin {} after end_bin {}",
                    element.index, region.name, region.start_bin, region.end_bin
                )));
            }
            if region.end_bin >= self.spectrum_size {
                return Err(ReduceError::RegionOutOfBounds {
                    element: element.index,
                    name: region.name.clone(),
                    start: region.start_bin,
                    end: region.end_bin,
                    size: self.spectrum_size,
                });
            }
            if Some(region.kind) != uniform_kind {
                return Err(ReduceError::Configuration(format!(
                    "element {}: region '{}' has kind {:?} but the configuration already uses {:?}; all regions must share one kind",
                    element.index, region.name, region.kind, uniform_kind
                )));
            }
            if element.regions[..i].iter().any(|r| r.name == region.name) {
                return Err(ReduceError::Configuration(format!(
                    "element {}: region name '{}' appears twice on the same element",
                    element.index, region.name
                )));
            }
        }
        Ok(())
    }

    /// Slots one element occupies in a delivered grade row.
    ///
    /// Virtual-scalar and partial-spectrum layouts always reserve one extra
    /// trailing slot for the out-of-window counts; a full-spectrum layout
    /// occupies the whole row.
    pub fn required_readout_width(&self, element: &DetectorElement) -> usize {
        match element.regions.first().map(|r| r.kind) {
            Some(RegionKind::VirtualScalar) => element.regions.len() + 1,
            Some(RegionKind::PartialSpectrum) => {
                element.regions.iter().map(RegionOfInterest::width).sum::<usize>() + 1
            }
            Some(RegionKind::FullSpectrum) => self.spectrum_size,
            None => 1,
        }
    }

    /// Smallest hardware readout width able to carry every element.
    ///
    /// Readout memory is programmed in power-of-two row widths, so this is
    /// the next power of two at or above the widest element requirement.
    pub fn minimum_hardware_width(&self) -> usize {
        self.elements
            .iter()
            .map(|e| self.required_readout_width(e))
            .max()
            .unwrap_or(1)
            .next_power_of_two()
    }
}

// ===== Tests =====
