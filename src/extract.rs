//! Reading extraction.
//!
//! This is the heart of the reduction: for each element of a frame, walk the
//! configured regions in declared order and turn the delivered grade rows
//! into corrected [`Reading`] values. The walk depends on the region kind:
//!
//! - **virtual scalar**: each region occupies one slot per grade row, in
//!   declaration order;
//! - **partial spectrum**: each region's bins are packed back to back;
//! - **full spectrum**: regions index the delivered row directly.
//!
//! The arithmetic depends on the grade mode. Ungraded windows are a plain
//! factor multiply. Threshold windows additionally recover good events lost
//! to the bad stream via the windowing ratio `allEvents / (goodIn +
//! goodOut)`. All16 windows build sixteen cumulative grade sums and carry no
//! per-bin deadtime multiply; flux normalization happens here when a usable
//! value is supplied.
//!
//! When the union of a non-excluded element's windows stops short of the
//! last spectrum bin (and the mode is not All16), a residual `OUT` reading
//! is synthesized from the final bin so the unclaimed tail stays visible.
//! Excluded elements keep their readings, with every count zeroed, so that
//! grouped channels stay positionally complete.

use ndarray::{s, Array2, ArrayView2, ArrayView3, Axis};

use crate::config::{
    DetectorConfiguration, DetectorElement, RegionKind, RegionOfInterest, ResolutionGradeMode,
};

/// Name of the synthesized out-of-window residual reading.
pub const OUT_READING_NAME: &str = "OUT";

/// Suffix of the uncorrected bad-stream counterpart in Threshold mode.
pub const BAD_SUFFIX: &str = "_bad";

/// Number of best grades summed for All16 scalar equivalents.
const BEST_GRADES: usize = 8;

// ===== Readings =====

/// One extracted, corrected measurement from one region of one element.
#[derive(Clone, Debug)]
pub enum Reading {
    /// Scalar window counts: one value in None and Threshold modes, sixteen
    /// cumulative grade sums in All16.
    Window {
        /// Channel name this reading is grouped under.
        roi_name: String,
        /// Element the reading came from.
        element: usize,
        /// First spectrum bin the window covers (inclusive).
        start_bin: usize,
        /// Last spectrum bin the window covers (inclusive).
        end_bin: usize,
        /// Window counts after mode-specific correction.
        counts: Vec<f64>,
        /// Whether the reading's scalar value is summed into `FF`.
        contributes_to_ff: bool,
        /// True for the uncorrected bad-stream counterpart of a Threshold
        /// window.
        bad_stream: bool,
        /// True for synthesized out-of-window residuals.
        out_of_window: bool,
    },
    /// Per-bin spectrum slice with its scalar equivalents.
    Spectrum {
        /// Channel name this reading is grouped under.
        roi_name: String,
        /// Element the reading came from.
        element: usize,
        /// First spectrum bin of the region (inclusive).
        start_bin: usize,
        /// Last spectrum bin of the region (inclusive).
        end_bin: usize,
        /// Counts as `[grade][bin]`, grade axis reversed for presentation:
        /// the hardware delivers the worst grade first, the record shows the
        /// best first (good before bad in Threshold mode).
        counts: Array2<f64>,
        /// Corrected scalar equivalent of the window.
        peak_area: f64,
        /// Bad-stream scalar equivalent, non-zero only in Threshold mode.
        peak_area_bad: f64,
        /// Whether `peak_area` is summed into `FF`.
        contributes_to_ff: bool,
    },
}

impl Reading {
    /// Channel name this reading is grouped under.
    pub fn roi_name(&self) -> &str {
        match self {
            Reading::Window { roi_name, .. } | Reading::Spectrum { roi_name, .. } => roi_name,
        }
    }

    /// Element the reading came from.
    pub fn element(&self) -> usize {
        match self {
            Reading::Window { element, .. } | Reading::Spectrum { element, .. } => *element,
        }
    }

    /// Whether the reading's scalar value is summed into `FF`.
    pub fn contributes_to_ff(&self) -> bool {
        match self {
            Reading::Window {
                contributes_to_ff, ..
            }
            | Reading::Spectrum {
                contributes_to_ff, ..
            } => *contributes_to_ff,
        }
    }

    /// Corrected scalar equivalent used for `FF` composition.
    ///
    /// All16 window readings contribute their best-8 cumulative sum.
    pub fn ff_value(&self, mode: ResolutionGradeMode) -> f64 {
        match self {
            Reading::Window { counts, .. } => {
                let slot = match mode {
                    ResolutionGradeMode::All16 => BEST_GRADES - 1,
                    ResolutionGradeMode::None | ResolutionGradeMode::Threshold => 0,
                };
                counts.get(slot).copied().unwrap_or(0.0)
            }
            Reading::Spectrum { peak_area, .. } => *peak_area,
        }
    }

    /// Bad-stream scalar summed into `FF_bad`.
    ///
    /// Out-of-window residuals are informational and never counted.
    pub fn ff_bad_value(&self) -> f64 {
        match self {
            Reading::Window {
                counts,
                bad_stream: true,
                out_of_window: false,
                ..
            } => counts.first().copied().unwrap_or(0.0),
            Reading::Window { .. } => 0.0,
            Reading::Spectrum { peak_area_bad, .. } => *peak_area_bad,
        }
    }

    /// Zero every count and scalar, keeping the reading's shape and name.
    fn clear_counts(&mut self) {
        match self {
            Reading::Window { counts, .. } => counts.iter_mut().for_each(|c| *c = 0.0),
            Reading::Spectrum {
                counts,
                peak_area,
                peak_area_bad,
                ..
            } => {
                counts.fill(0.0);
                *peak_area = 0.0;
                *peak_area_bad = 0.0;
            }
        }
    }
}

// ===== Frame extraction =====

/// Extract every reading of one frame.
///
/// `spectra` is the frame's `[element][grade][bin]` view, `factors` the
/// per-element deadtime factors, `incident_flux` the optional flux used for
/// All16 normalization.
pub fn extract_frame(
    config: &DetectorConfiguration,
    spectra: ArrayView3<'_, u32>,
    factors: &[f64],
    incident_flux: Option<f64>,
) -> Vec<Reading> {
    let mut readings = Vec::new();
    for (index, element) in config.elements.iter().enumerate() {
        let rows = spectra.index_axis(Axis(0), index);
        let first = readings.len();
        extract_element(
            config,
            element,
            rows,
            factors[index],
            incident_flux,
            &mut readings,
        );
        if element.excluded {
            for reading in &mut readings[first..] {
                reading.clear_counts();
            }
        }
    }
    readings
}

fn extract_element(
    config: &DetectorConfiguration,
    element: &DetectorElement,
    rows: ArrayView2<'_, u32>,
    factor: f64,
    incident_flux: Option<f64>,
    readings: &mut Vec<Reading>,
) {
    let mode = config.grade_mode;
    match config.region_kind() {
        Some(RegionKind::VirtualScalar) | None => {
            for (slot, roi) in element.regions.iter().enumerate() {
                window_readings_at_slot(
                    &roi.name,
                    element.index,
                    (roi.start_bin, roi.end_bin),
                    slot,
                    rows,
                    factor,
                    mode,
                    incident_flux,
                    false,
                    readings,
                );
            }
        }
        Some(RegionKind::PartialSpectrum) => {
            let mut position = 0;
            for roi in &element.regions {
                readings.push(extract_spectrum_region(
                    roi,
                    element.index,
                    rows,
                    position,
                    factor,
                    mode,
                ));
                position += roi.width();
            }
        }
        Some(RegionKind::FullSpectrum) => {
            for roi in &element.regions {
                readings.push(extract_spectrum_region(
                    roi,
                    element.index,
                    rows,
                    roi.start_bin,
                    factor,
                    mode,
                ));
            }
        }
    }

    // Residual reading from the unclaimed tail. All16 windows already span
    // every grade, so no residual is defined for that mode.
    if mode != ResolutionGradeMode::All16 {
        if let Some((start, end)) = unclaimed_range(element, config.spectrum_size) {
            window_readings_at_slot(
                OUT_READING_NAME,
                element.index,
                (start, end),
                config.spectrum_size - 1,
                rows,
                factor,
                mode,
                incident_flux,
                true,
                readings,
            );
        }
    }
}

/// Bin range left unclaimed by the element's windows, if any.
fn unclaimed_range(element: &DetectorElement, spectrum_size: usize) -> Option<(usize, usize)> {
    match element.regions.iter().map(|r| r.end_bin).max() {
        Some(end) if end + 1 >= spectrum_size => None,
        Some(end) => Some((end + 1, spectrum_size - 1)),
        None => Some((0, spectrum_size - 1)),
    }
}

// ===== Window readings =====

#[allow(clippy::too_many_arguments)]
fn window_readings_at_slot(
    name: &str,
    element: usize,
    bins: (usize, usize),
    slot: usize,
    rows: ArrayView2<'_, u32>,
    factor: f64,
    mode: ResolutionGradeMode,
    incident_flux: Option<f64>,
    out_of_window: bool,
    readings: &mut Vec<Reading>,
) {
    let (start_bin, end_bin) = bins;
    match mode {
        ResolutionGradeMode::None => {
            let raw = f64::from(rows[[0, slot]]);
            readings.push(Reading::Window {
                roi_name: name.to_string(),
                element,
                start_bin,
                end_bin,
                counts: vec![raw * factor],
                contributes_to_ff: !out_of_window,
                bad_stream: false,
                out_of_window,
            });
        }
        ResolutionGradeMode::Threshold => {
            let bad = f64::from(rows[[0, slot]]);
            let good = f64::from(rows[[1, slot]]);
            let good_out = f64::from(rows[[1, rows.ncols() - 1]]);
            let all_events = total_counts(rows);
            let corrected = threshold_window_correction(good, good_out, all_events, factor);
            // The bad stream is reported raw, for interest's sake only.
            readings.push(Reading::Window {
                roi_name: format!("{name}{BAD_SUFFIX}"),
                element,
                start_bin,
                end_bin,
                counts: vec![bad],
                contributes_to_ff: false,
                bad_stream: true,
                out_of_window,
            });
            readings.push(Reading::Window {
                roi_name: name.to_string(),
                element,
                start_bin,
                end_bin,
                counts: vec![corrected],
                contributes_to_ff: !out_of_window,
                bad_stream: false,
                out_of_window,
            });
        }
        ResolutionGradeMode::All16 => {
            let mut counts = cumulative_grade_sums(rows, slot);
            if let Some(flux) = incident_flux {
                if flux.is_finite() && flux > 0.0 {
                    for count in &mut counts {
                        *count /= flux;
                    }
                }
            }
            readings.push(Reading::Window {
                roi_name: name.to_string(),
                element,
                start_bin,
                end_bin,
                counts,
                contributes_to_ff: !out_of_window,
                bad_stream: false,
                out_of_window,
            });
        }
    }
}

/// Recover good events lost to the bad stream.
///
/// `allEvents / (goodIn + goodOut)` scales the window by the fraction of
/// events the threshold kept; a windowless element (zero kept events)
/// corrects to zero rather than dividing by zero.
fn threshold_window_correction(good_in: f64, good_out: f64, all_events: f64, factor: f64) -> f64 {
    let kept = good_in + good_out;
    if kept <= 0.0 {
        return 0.0;
    }
    good_in * (all_events / kept) * factor
}

/// Cumulative grade sums for one slot: output bin `b` holds the raw counts
/// of every grade at or above `15 - b`.
fn cumulative_grade_sums(rows: ArrayView2<'_, u32>, slot: usize) -> Vec<f64> {
    let grades = rows.nrows();
    let mut counts = vec![0.0; grades];
    let mut accumulated = 0u64;
    for (bin, count) in counts.iter_mut().enumerate() {
        accumulated += u64::from(rows[[grades - 1 - bin, slot]]);
        *count = accumulated as f64;
    }
    counts
}

/// Total raw counts over every grade row of the element.
fn total_counts(rows: ArrayView2<'_, u32>) -> f64 {
    rows.iter().map(|&v| u64::from(v)).sum::<u64>() as f64
}

// ===== Spectrum readings =====

fn extract_spectrum_region(
    roi: &RegionOfInterest,
    element: usize,
    rows: ArrayView2<'_, u32>,
    row_offset: usize,
    factor: f64,
    mode: ResolutionGradeMode,
) -> Reading {
    let width = roi.width();
    let slice = rows.slice(s![.., row_offset..row_offset + width]);
    let corrected = slice.mapv(|v| f64::from(v) * factor);

    let (peak_area, peak_area_bad) = match mode {
        ResolutionGradeMode::None => (corrected.sum(), 0.0),
        ResolutionGradeMode::Threshold => {
            let bad_in = row_sum(slice, 0);
            let good_in = row_sum(slice, 1);
            let good_out = f64::from(rows[[1, rows.ncols() - 1]]);
            let all_events = total_counts(rows);
            (
                threshold_window_correction(good_in, good_out, all_events, factor),
                bad_in * factor,
            )
        }
        ResolutionGradeMode::All16 => (corrected.slice(s![BEST_GRADES.., ..]).sum(), 0.0),
    };

    // Worst grade is delivered first; present the best grade first.
    let counts = corrected.slice(s![..;-1, ..]).to_owned();

    Reading::Spectrum {
        roi_name: roi.name.clone(),
        element,
        start_bin: roi.start_bin,
        end_bin: roi.end_bin,
        counts,
        peak_area,
        peak_area_bad,
        contributes_to_ff: true,
    }
}

fn row_sum(rows: ArrayView2<'_, u32>, row: usize) -> f64 {
    rows.index_axis(Axis(0), row)
        .iter()
        .map(|&v| u64::from(v))
        .sum::<u64>() as f64
}

// ===== Tests =====
