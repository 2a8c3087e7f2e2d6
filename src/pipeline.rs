//! Reduction pipeline from raw readout buffers to per-frame records.
//!
//! The pipeline ties the stages together: unpack the flat hardware buffers,
//! compute per-element deadtime factors, extract corrected readings, and
//! assemble each frame's named output record. Frames are independent, so
//! they are reduced in parallel; the returned records are always in frame
//! order.

use rayon::prelude::*;

use crate::assemble::{
    self, Channel, ChannelValue, FrameRecord, OutputOptions, FF_CHANNEL, SCALERS_CHANNEL,
};
use crate::config::DetectorConfiguration;
use crate::deadtime::{self, ExponentialLossInversion, PileupInversion};
use crate::error::{ReduceError, ReduceResult};
use crate::extract;
use crate::unpack::{ScalerFrames, SpectrumFrames};

/// Borrowed raw buffers of one readout call.
///
/// `scaler_data` holds four hardware words per element per frame and
/// `spectrum_data` the grade rows, both flat in frame-major order exactly as
/// delivered. `incident_flux` optionally carries one monitor value per frame
/// for All16 normalization.
#[derive(Clone, Copy, Debug)]
pub struct RawReadout<'a> {
    /// Flat scaler words, `[frame][element][word]`.
    pub scaler_data: &'a [i32],
    /// Flat spectrum counts, `[frame][element][grade][bin]`.
    pub spectrum_data: &'a [i32],
    /// Number of frames both buffers cover.
    pub num_frames: usize,
    /// Optional per-frame incident flux monitor values.
    pub incident_flux: Option<&'a [f64]>,
}

/// Readout-correction engine for one detector configuration.
///
/// A pipeline is built once per configuration and reused across readout
/// calls. It is responsible for:
/// - validating buffer lengths against the configured geometry
/// - reinterpreting the signed hardware words as unsigned counts
/// - applying deadtime correction through a pluggable pileup inversion
/// - extracting region readings and assembling schema-stable records
///
/// # Example
///
/// ```rust,ignore
/// use xrf_reduce::assemble::OutputOptions;
/// use xrf_reduce::config::DetectorConfiguration;
/// use xrf_reduce::pipeline::{RawReadout, ReductionPipeline};
///
/// let config = DetectorConfiguration::from_toml_path("detector.toml")?;
/// let pipeline = ReductionPipeline::new(config, OutputOptions::default())?;
///
/// let records = pipeline.process(&RawReadout {
///     scaler_data: &scalers,
///     spectrum_data: &spectra,
///     num_frames: 10,
///     incident_flux: None,
/// })?;
/// println!("FF = {:?}", records[0].scalar("FF"));
/// ```
pub struct ReductionPipeline {
    config: DetectorConfiguration,
    options: OutputOptions,
    inversion: Box<dyn PileupInversion>,
}

impl ReductionPipeline {
    /// Build a pipeline for a validated configuration.
    pub fn new(config: DetectorConfiguration, options: OutputOptions) -> ReduceResult<Self> {
        config.validate()?;
        Ok(ReductionPipeline {
            config,
            options,
            inversion: Box::new(ExponentialLossInversion),
        })
    }

    /// Replace the pileup inversion model.
    #[must_use]
    pub fn with_inversion(mut self, inversion: Box<dyn PileupInversion>) -> Self {
        self.inversion = inversion;
        self
    }

    /// The configuration this pipeline reduces against.
    pub fn config(&self) -> &DetectorConfiguration {
        &self.config
    }

    /// Reduce a full readout to one record per frame.
    ///
    /// Frames are processed in parallel; records come back in frame order.
    pub fn process(&self, readout: &RawReadout<'_>) -> ReduceResult<Vec<FrameRecord>> {
        if let Some(flux) = readout.incident_flux {
            if flux.len() != readout.num_frames {
                return Err(ReduceError::FluxLengthMismatch {
                    actual: flux.len(),
                    frames: readout.num_frames,
                });
            }
        }

        let elements = self.config.num_elements();
        let scalers = ScalerFrames::unpack(readout.scaler_data, readout.num_frames, elements)?;
        let spectra = SpectrumFrames::unpack(
            readout.spectrum_data,
            readout.num_frames,
            elements,
            self.config.grade_mode.grade_count(),
            self.config.spectrum_size,
        )?;

        tracing::debug!(
            frames = readout.num_frames,
            elements,
            mode = ?self.config.grade_mode,
            "reducing readout"
        );

        let records = (0..readout.num_frames)
            .into_par_iter()
            .map(|frame| self.reduce_frame(frame, &scalers, &spectra, readout.incident_flux))
            .collect();
        Ok(records)
    }

    /// Reduce a scaler-only readout, with no spectrum memory involved.
    ///
    /// Each record carries a `scalers` channel of per-element corrected
    /// in-window counts (zero for excluded elements) and their sum as `FF`.
    pub fn process_scaler_memory(
        &self,
        scaler_data: &[i32],
        num_frames: usize,
    ) -> ReduceResult<Vec<FrameRecord>> {
        let elements = self.config.num_elements();
        let scalers = ScalerFrames::unpack(scaler_data, num_frames, elements)?;

        let records = (0..num_frames)
            .into_par_iter()
            .map(|frame| {
                let factors = self.frame_factors(&scalers, frame);
                let corrected: Vec<f64> = self
                    .config
                    .elements
                    .iter()
                    .map(|element| {
                        if element.excluded {
                            0.0
                        } else {
                            scalers.element(frame, element.index).in_window as f64
                                * factors[element.index]
                        }
                    })
                    .collect();
                let ff = corrected.iter().sum();

                let mut channels = vec![
                    Channel::counts(SCALERS_CHANNEL, ChannelValue::Elements(corrected)),
                    Channel::counts(FF_CHANNEL, ChannelValue::Scalar(ff)),
                ];
                if self.options.raw_scaler_channels {
                    channels.extend(assemble::raw_scaler_channels(&scalers, frame));
                }
                FrameRecord { frame, channels }
            })
            .collect();
        Ok(records)
    }

    fn reduce_frame(
        &self,
        frame: usize,
        scalers: &ScalerFrames,
        spectra: &SpectrumFrames,
        incident_flux: Option<&[f64]>,
    ) -> FrameRecord {
        let factors = self.frame_factors(scalers, frame);
        let flux = incident_flux.map(|values| values[frame]);
        let view = spectra.frame(frame);
        let readings = extract::extract_frame(&self.config, view, &factors, flux);
        assemble::assemble_frame(
            frame,
            &readings,
            &self.config,
            &self.options,
            scalers,
            view,
            &factors,
            flux,
        )
    }

    /// Per-element factors for one frame, honoring the raw passthrough
    /// option by pinning every factor to `1.0`.
    fn frame_factors(&self, scalers: &ScalerFrames, frame: usize) -> Vec<f64> {
        if self.options.save_raw_spectrum {
            vec![1.0; self.config.num_elements()]
        } else {
            deadtime::frame_factors(scalers, frame, &self.config, self.inversion.as_ref())
        }
    }
}

// ===== Tests =====
