//! Deadtime correction factors.
//!
//! Every element loses counts while its pulse processor is busy. The loss is
//! estimated per frame from the hardware scaler words and folded into a
//! single multiplicative correction factor:
//!
//! 1. live time is the clock cycles minus reset cycles, in seconds;
//! 2. the measured all-event rate is inverted through a pileup model to
//!    recover the true input rate;
//! 3. the factor combines the live-time ratio with the exponential
//!    in-window loss at that input rate.
//!
//! Degenerate inputs (zero live time, overflowed counters) drive the factor
//! to NaN or infinity; those are recovered to a neutral 1.0 on the spot so a
//! dead element never poisons the rest of the frame. Excluded elements skip
//! the computation entirely and also get 1.0; their counts are zeroed during
//! extraction.

use crate::config::DetectorConfiguration;
use crate::unpack::{HardwareScalers, ScalerFrames};

/// TFG clock period in seconds.
pub const CLOCK_PERIOD_S: f64 = 12.5e-9;

/// Live counting time of a frame in seconds.
#[inline]
pub fn live_time_seconds(scalers: HardwareScalers) -> f64 {
    (scalers.clock_cycles as f64 - scalers.resets as f64) * CLOCK_PERIOD_S
}

// ===== Pileup inversion =====

/// Recovers the true input rate from a pileup-suppressed measured rate.
///
/// Implementations must be monotone in `measured` over their valid range and
/// total: any finite input yields a finite output. Degenerate arguments
/// (non-positive rate or dead time) return the measured rate unchanged.
pub trait PileupInversion: Send + Sync {
    /// Invert the pileup loss: given the measured all-event rate in events/s
    /// and the process dead time `tau` in seconds, return the corrected
    /// input rate in events/s.
    fn invert(&self, measured: f64, tau: f64) -> f64;
}

/// Default inversion for the exponential pileup-loss model
/// `measured = rate * exp(-rate * tau)`.
///
/// The low-rate branch is solved by Newton iteration started at the measured
/// rate; on this branch the iteration approaches the root from below and
/// converges monotonically. The model saturates at `1/(e*tau)`, so measured
/// rates at or above saturation are pinned to the turnover rate `1/tau`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExponentialLossInversion;

impl PileupInversion for ExponentialLossInversion {
    fn invert(&self, measured: f64, tau: f64) -> f64 {
        if !(measured > 0.0) || !(tau > 0.0) || !measured.is_finite() {
            return measured;
        }
        let turnover = 1.0 / tau;
        let saturation = turnover * (-1.0f64).exp();
        if measured >= saturation {
            return turnover;
        }

        let mut rate = measured;
        for _ in 0..32 {
            let attenuation = (-rate * tau).exp();
            let derivative = attenuation * (1.0 - rate * tau);
            if derivative <= f64::EPSILON {
                break;
            }
            let step = (rate * attenuation - measured) / derivative;
            rate -= step;
            if step.abs() <= rate * 1e-14 {
                break;
            }
        }
        rate
    }
}

// ===== Correction factors =====

/// Deadtime correction factor for one element in one frame.
///
/// `all_event_tau` and `in_window_tau` are the process dead times already
/// evaluated at the working energy. A non-finite result is sanitized to 1.0.
pub fn correction_factor(
    scalers: HardwareScalers,
    all_event_tau: f64,
    in_window_tau: f64,
    inversion: &dyn PileupInversion,
) -> f64 {
    let live_time = live_time_seconds(scalers);
    let measured_rate = scalers.total_events as f64 / live_time;
    let input_rate = inversion.invert(measured_rate, all_event_tau);

    let frame_time = scalers.clock_cycles as f64 * CLOCK_PERIOD_S;
    let factor = (frame_time / live_time) / (-input_rate * 2.0 * in_window_tau).exp();

    if factor.is_finite() {
        factor
    } else {
        tracing::debug!(
            total_events = scalers.total_events,
            clock_cycles = scalers.clock_cycles,
            resets = scalers.resets,
            "deadtime factor not finite, using 1.0"
        );
        1.0
    }
}

/// Per-element correction factors for one frame.
///
/// Excluded elements are assigned 1.0 without touching their scaler words.
pub fn frame_factors(
    scalers: &ScalerFrames,
    frame: usize,
    config: &DetectorConfiguration,
    inversion: &dyn PileupInversion,
) -> Vec<f64> {
    config
        .elements
        .iter()
        .enumerate()
        .map(|(index, element)| {
            if element.excluded {
                1.0
            } else {
                let calib = &element.calibration;
                correction_factor(
                    scalers.element(frame, index),
                    calib.all_event_dead_time(config.deadtime_energy),
                    calib.in_window_dead_time(config.deadtime_energy),
                    inversion,
                )
            }
        })
        .collect()
}

// ===== Tests =====
