//! End-to-end reduction pipeline tests.
//!
//! Drives the full path from flat hardware buffers to per-frame records and
//! pins down the behavior downstream consumers rely on.
//!
//! # Test Coverage
//!
//! - Bit-identical output for repeated reductions of the same buffers
//! - Exact FF composition and zeroed contributions from excluded elements
//! - Deadtime sanitization when a frame carries no live time
//! - Threshold windowing and All16 flux normalization arithmetic
//! - Out-of-window residual synthesis and channel schema stability
//! - TOML configuration loading, scaler-only readout, and live rate stats

use ndarray::Array3;
use tempfile::TempDir;

use xrf_reduce::assemble::{
    OutputOptions, ALL_ELEMENT_SUM_CHANNEL, FF_BAD_CHANNEL, FF_CHANNEL, SCALERS_CHANNEL,
};
use xrf_reduce::config::{
    DeadtimeCalibration, DetectorConfiguration, DetectorElement, RegionKind, RegionOfInterest,
    ResolutionGradeMode,
};
use xrf_reduce::deadtime::ExponentialLossInversion;
use xrf_reduce::extract::{self, Reading};
use xrf_reduce::pipeline::{RawReadout, ReductionPipeline};
use xrf_reduce::stats;

// =============================================================================
// Test Helper Functions
// =============================================================================

/// Create a configuration of identical elements with one region each.
fn create_test_config(
    num_elements: usize,
    spectrum_size: usize,
    mode: ResolutionGradeMode,
    region: RegionOfInterest,
) -> DetectorConfiguration {
    let elements = (0..num_elements)
        .map(|index| DetectorElement {
            index,
            excluded: false,
            regions: vec![region.clone()],
            calibration: DeadtimeCalibration::default(),
        })
        .collect();
    DetectorConfiguration {
        elements,
        spectrum_size,
        grade_mode: mode,
        deadtime_energy: None,
    }
}

fn window_region(name: &str, start: usize, end: usize) -> RegionOfInterest {
    RegionOfInterest {
        name: name.into(),
        start_bin: start,
        end_bin: end,
        kind: RegionKind::VirtualScalar,
    }
}

fn full_spectrum_region(name: &str, start: usize, end: usize) -> RegionOfInterest {
    RegionOfInterest {
        name: name.into(),
        start_bin: start,
        end_bin: end,
        kind: RegionKind::FullSpectrum,
    }
}

/// Scaler words for one element. Zero dead times make the factor the plain
/// live-time ratio, so `resets = clock / 2` pins it to exactly 2.
fn scaler_words(total: i32, resets: i32, in_window: i32, clock: i32) -> Vec<i32> {
    vec![total, resets, in_window, clock]
}

/// Flat spectrum buffer from explicit grade rows, one entry per element per
/// frame in delivery order. Counts above `i32::MAX` wrap into the sign bit
/// exactly as the hardware DMA does.
fn spectrum_buffer(element_rows: &[Vec<Vec<u32>>]) -> Vec<i32> {
    let mut flat = Vec::new();
    for rows in element_rows {
        for row in rows {
            flat.extend(row.iter().map(|&v| v as i32));
        }
    }
    flat
}

// =============================================================================
// End-to-End Reduction
// =============================================================================

#[test]
fn test_single_window_round_trip() {
    // One element, one full-coverage window, no deadtime: counts must come
    // through unchanged.
    let config = create_test_config(
        1,
        16,
        ResolutionGradeMode::None,
        window_region("peak", 0, 15),
    );
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();

    let mut row = vec![0u32; 16];
    row[0] = 1000;
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_words(1000, 0, 1000, 0),
            spectrum_data: &spectrum_buffer(&[vec![row]]),
            num_frames: 1,
            incident_flux: None,
        })
        .unwrap();

    let record = &records[0];
    assert_eq!(
        record.channel("peak").unwrap().value.as_elements().unwrap(),
        &[1000.0]
    );
    assert_eq!(record.scalar(FF_CHANNEL), Some(1000.0));
}

#[test]
fn test_repeated_reduction_is_bit_identical() {
    let config = create_test_config(
        2,
        8,
        ResolutionGradeMode::Threshold,
        window_region("peak", 0, 6),
    );
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();

    let mut scaler_data = Vec::new();
    let mut rows = Vec::new();
    for element in 0..2u32 {
        scaler_data.extend(scaler_words(40_000, 150_000, 30_000, 8_000_000));
        rows.push(vec![
            vec![element + 7, 3, 0, 0, 0, 0, 0, 11],
            vec![900 + element, 40, 0, 0, 0, 0, 0, 17],
        ]);
    }
    let spectrum_data = spectrum_buffer(&rows);
    let readout = RawReadout {
        scaler_data: &scaler_data,
        spectrum_data: &spectrum_data,
        num_frames: 1,
        incident_flux: None,
    };

    let first = pipeline.process(&readout).unwrap();
    let second = pipeline.process(&readout).unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn test_channel_schema_stable_across_frames() {
    let mut config = create_test_config(
        2,
        8,
        ResolutionGradeMode::None,
        window_region("ka", 0, 3),
    );
    for element in &mut config.elements {
        element.regions.push(window_region("kb", 4, 6));
    }
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();

    // Two frames with unrelated raw content.
    let mut scaler_data = Vec::new();
    let mut rows = Vec::new();
    for value in [5u32, 900, 13, 44] {
        scaler_data.extend(scaler_words(1000, 0, 600, 8_000_000));
        rows.push(vec![vec![value, value * 2, 0, 0, 0, 0, 0, 1]]);
    }
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_data,
            spectrum_data: &spectrum_buffer(&rows),
            num_frames: 2,
            incident_flux: None,
        })
        .unwrap();

    assert_eq!(records[0].channel_names(), records[1].channel_names());
    assert_eq!(
        records[0].channel_names(),
        vec!["ka", "kb", "OUT", FF_CHANNEL]
    );
}

#[test]
fn test_excluded_elements_contribute_zero() {
    let mut config = create_test_config(
        2,
        4,
        ResolutionGradeMode::None,
        window_region("peak", 0, 3),
    );
    config.elements[1].excluded = true;
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();

    let mut scaler_data = scaler_words(1000, 0, 700, 0);
    scaler_data.extend(scaler_words(i32::MIN, 12, 9999, 77));
    let rows = vec![
        vec![vec![700u32, 0, 0, 0]],
        vec![vec![u32::MAX, 1, 2, 3]],
    ];
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_data,
            spectrum_data: &spectrum_buffer(&rows),
            num_frames: 1,
            incident_flux: None,
        })
        .unwrap();

    let record = &records[0];
    // The excluded element keeps its slot in the grouped channel, at zero.
    assert_eq!(
        record.channel("peak").unwrap().value.as_elements().unwrap(),
        &[700.0, 0.0]
    );
    assert_eq!(record.scalar(FF_CHANNEL), Some(700.0));
}

#[test]
fn test_ff_is_exact_for_integer_windows() {
    let config = create_test_config(
        3,
        8,
        ResolutionGradeMode::None,
        window_region("peak", 0, 6),
    );
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();

    let mut scaler_data = Vec::new();
    let mut rows = Vec::new();
    for value in [1000u32, 2000, 3000] {
        // Zero live time in every element pins each factor to exactly 1.
        scaler_data.extend(scaler_words(5000, 5000, 5000, 5000));
        rows.push(vec![vec![value, 0, 0, 0, 0, 0, 0, 123]]);
    }
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_data,
            spectrum_data: &spectrum_buffer(&rows),
            num_frames: 1,
            incident_flux: None,
        })
        .unwrap();

    // Exact equality: residual OUT readings never contribute.
    assert_eq!(records[0].scalar(FF_CHANNEL), Some(6000.0));
}

// =============================================================================
// Correction Arithmetic
// =============================================================================

#[test]
fn test_zero_live_time_factor_is_unity() {
    let config = create_test_config(
        1,
        4,
        ResolutionGradeMode::None,
        window_region("peak", 0, 3),
    );
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();

    // Clock cycles equal reset ticks, so the frame has no live time at all.
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_words(123_456, 5_000_000, 800, 5_000_000),
            spectrum_data: &spectrum_buffer(&[vec![vec![800, 0, 0, 0]]]),
            num_frames: 1,
            incident_flux: None,
        })
        .unwrap();

    assert_eq!(
        records[0].channel("peak").unwrap().value.as_elements().unwrap(),
        &[800.0]
    );
}

#[test]
fn test_threshold_windowing_formula() {
    let config = create_test_config(
        1,
        8,
        ResolutionGradeMode::Threshold,
        window_region("peak", 0, 6),
    );
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();

    // Half the clock spent resetting and zero dead times make the deadtime
    // factor exactly 2. Bad window 50, good window 200, good out bin 10.
    let mut bad = vec![0u32; 8];
    bad[0] = 50;
    let mut good = vec![0u32; 8];
    good[0] = 200;
    good[7] = 10;
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_words(260, 4_000_000, 210, 8_000_000),
            spectrum_data: &spectrum_buffer(&[vec![bad, good]]),
            num_frames: 1,
            incident_flux: None,
        })
        .unwrap();

    let record = &records[0];
    let good_corrected = record.channel("peak").unwrap().value.as_elements().unwrap()[0];
    // allEvents spans both full rows including the out bin.
    let expected = 200.0 * ((50.0 + 200.0 + 10.0) / (200.0 + 10.0)) * 2.0;
    assert!((good_corrected - expected).abs() / expected < 1e-9);

    // The bad stream is reported raw and aggregated separately.
    assert_eq!(
        record.channel("peak_bad").unwrap().value.as_elements().unwrap(),
        &[50.0]
    );
    assert_eq!(record.scalar(FF_BAD_CHANNEL), Some(50.0));
}

#[test]
fn test_all16_skips_degenerate_flux() {
    let config = create_test_config(
        1,
        4,
        ResolutionGradeMode::All16,
        window_region("peak", 0, 3),
    );
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();

    // Grade g carries g + 1 counts, so the cumulative sums are known.
    let rows: Vec<Vec<u32>> = (0..16u32).map(|g| vec![g + 1, 0, 0, 0]).collect();
    let spectrum_data = spectrum_buffer(&[rows]);
    let scaler_data = scaler_words(136, 0, 136, 0);

    for flux in [0.0, -5.0] {
        let records = pipeline
            .process(&RawReadout {
                scaler_data: &scaler_data,
                spectrum_data: &spectrum_data,
                num_frames: 1,
                incident_flux: Some(&[flux]),
            })
            .unwrap();
        let grades = records[0]
            .channel("peak")
            .unwrap()
            .value
            .as_element_grades()
            .unwrap();
        // Un-normalized cumulative sums are retained.
        assert_eq!(grades[0][0], 16.0);
        assert_eq!(grades[0][15], 136.0);
    }

    // A usable flux divides the same sums.
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_data,
            spectrum_data: &spectrum_data,
            num_frames: 1,
            incident_flux: Some(&[2.0]),
        })
        .unwrap();
    let grades = records[0]
        .channel("peak")
        .unwrap()
        .value
        .as_element_grades()
        .unwrap();
    assert_eq!(grades[0][15], 68.0);
}

#[test]
fn test_raw_passthrough_disables_correction() {
    let mut config = create_test_config(
        1,
        4,
        ResolutionGradeMode::None,
        window_region("peak", 0, 3),
    );
    config.elements[0].calibration.in_window_offset = 1.5e-6;

    let scaler_data = scaler_words(60_000, 0, 50_000, 8_000_000);
    let spectrum_data = spectrum_buffer(&[vec![vec![50_000, 0, 0, 0]]]);
    let readout = RawReadout {
        scaler_data: &scaler_data,
        spectrum_data: &spectrum_data,
        num_frames: 1,
        incident_flux: None,
    };

    let corrected = ReductionPipeline::new(config.clone(), OutputOptions::default())
        .unwrap()
        .process(&readout)
        .unwrap();
    let raw = ReductionPipeline::new(
        config,
        OutputOptions {
            save_raw_spectrum: true,
            ..OutputOptions::default()
        },
    )
    .unwrap()
    .process(&readout)
    .unwrap();

    assert!(corrected[0].scalar(FF_CHANNEL).unwrap() > 50_000.0);
    assert_eq!(raw[0].scalar(FF_CHANNEL), Some(50_000.0));
}

// =============================================================================
// Residual Synthesis
// =============================================================================

#[test]
fn test_out_residual_covers_unclaimed_bins() {
    let config = create_test_config(
        1,
        16,
        ResolutionGradeMode::None,
        window_region("peak", 0, 10),
    );

    let mut row = vec![0u32; 16];
    row[0] = 500;
    row[15] = 42;
    let spectra = Array3::from_shape_vec((1, 1, 16), row).unwrap();
    let readings = extract::extract_frame(&config, spectra.view(), &[1.0], None);

    let residuals: Vec<&Reading> = readings
        .iter()
        .filter(|r| r.roi_name() == "OUT")
        .collect();
    assert_eq!(residuals.len(), 1);
    match residuals[0] {
        Reading::Window {
            start_bin,
            end_bin,
            counts,
            ..
        } => {
            assert_eq!((*start_bin, *end_bin), (11, 15));
            assert_eq!(counts[0], 42.0);
        }
        other => panic!("expected a window residual, got {other:?}"),
    }

    // At the record level the residual appears as its own channel.
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_words(500, 0, 500, 0),
            spectrum_data: &spectrum_buffer(&[vec![{
                let mut row = vec![0u32; 16];
                row[0] = 500;
                row[15] = 42;
                row
            }]]),
            num_frames: 1,
            incident_flux: None,
        })
        .unwrap();
    assert_eq!(
        records[0].channel("OUT").unwrap().value.as_elements().unwrap(),
        &[42.0]
    );
}

#[test]
fn test_full_coverage_omits_residual() {
    let config = create_test_config(
        1,
        16,
        ResolutionGradeMode::None,
        window_region("peak", 0, 15),
    );
    let spectra = Array3::from_shape_vec((1, 1, 16), vec![1u32; 16]).unwrap();
    let readings = extract::extract_frame(&config, spectra.view(), &[1.0], None);
    assert!(readings.iter().all(|r| r.roi_name() != "OUT"));
}

// =============================================================================
// Aggregate Channels
// =============================================================================

#[test]
fn test_all_element_sum_skips_excluded_spectra() {
    let mut config = create_test_config(
        2,
        4,
        ResolutionGradeMode::None,
        full_spectrum_region("spectrum", 0, 3),
    );
    config.elements[1].excluded = true;
    let options = OutputOptions {
        sum_all_elements: true,
        ..OutputOptions::default()
    };
    let pipeline = ReductionPipeline::new(config, options).unwrap();

    let mut scaler_data = scaler_words(40, 0, 40, 0);
    scaler_data.extend(scaler_words(4000, 0, 4000, 0));
    let rows = vec![
        vec![vec![10u32, 10, 10, 10]],
        vec![vec![999u32, 999, 999, 999]],
    ];
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_data,
            spectrum_data: &spectrum_buffer(&rows),
            num_frames: 1,
            incident_flux: None,
        })
        .unwrap();

    let sum = records[0].channel(ALL_ELEMENT_SUM_CHANNEL).unwrap();
    assert_eq!(sum.value.as_spectrum().unwrap(), &[10.0, 10.0, 10.0, 10.0]);
}

// =============================================================================
// Configuration Files
// =============================================================================

#[test]
fn test_configuration_loads_from_toml_file() {
    let toml = r#"
spectrum_size = 16
grade_mode = "threshold"

[[elements]]
index = 0

[[elements.regions]]
name = "peak"
start_bin = 0
end_bin = 14
kind = "virtual_scalar"

[elements.calibration]
all_event_offset = 1.25e-6
in_window_offset = 2.8e-7
"#;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("detector.toml");
    std::fs::write(&path, toml).unwrap();

    let config = DetectorConfiguration::from_toml_path(&path).unwrap();
    assert_eq!(config.num_elements(), 1);
    assert_eq!(config.grade_mode, ResolutionGradeMode::Threshold);

    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();
    let mut bad = vec![0u32; 16];
    bad[0] = 3;
    let mut good = vec![0u32; 16];
    good[0] = 90;
    let records = pipeline
        .process(&RawReadout {
            scaler_data: &scaler_words(93, 0, 90, 0),
            spectrum_data: &spectrum_buffer(&[vec![bad, good]]),
            num_frames: 1,
            incident_flux: None,
        })
        .unwrap();
    assert!(records[0].channel("peak").is_some());
    assert!(records[0].channel("peak_bad").is_some());
}

// =============================================================================
// Scaler-Only Readout and Live Rates
// =============================================================================

#[test]
fn test_scaler_memory_path_applies_window_corrections() {
    let config = create_test_config(
        1,
        4,
        ResolutionGradeMode::None,
        window_region("peak", 0, 3),
    );
    let pipeline = ReductionPipeline::new(config, OutputOptions::default()).unwrap();

    // Factor pinned to exactly 2 by spending half the clock resetting.
    let records = pipeline
        .process_scaler_memory(&scaler_words(700, 4_000_000, 500, 8_000_000), 1)
        .unwrap();

    let record = &records[0];
    assert_eq!(
        record
            .channel(SCALERS_CHANNEL)
            .unwrap()
            .value
            .as_elements()
            .unwrap(),
        &[1000.0]
    );
    assert_eq!(record.scalar(FF_CHANNEL), Some(1000.0));
}

#[test]
fn test_live_stats_report_rates() {
    let config = create_test_config(
        1,
        4,
        ResolutionGradeMode::None,
        window_region("peak", 0, 3),
    );
    // 0.1 s of live time.
    let raw = scaler_words(1000, 0, 600, 8_000_000);
    let element_stats =
        stats::live_element_stats(&config, &raw, &ExponentialLossInversion).unwrap();

    assert_eq!(element_stats.len(), 1);
    assert!((element_stats[0].total_rate - 10_000.0).abs() < 1e-6);
    assert!((element_stats[0].in_window_rate - 6_000.0).abs() < 1e-6);
    assert_eq!(element_stats[0].correction_factor, 1.0);
}
