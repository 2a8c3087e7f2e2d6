//! Live element statistics.
//!
//! While a scan runs, operators watch per-element rates to judge whether the
//! detector is saturating. This module computes those rates from a single
//! frame of raw scaler words without touching spectrum memory, so it is
//! cheap enough to poll.

use serde::Serialize;

use crate::config::DetectorConfiguration;
use crate::deadtime::{self, live_time_seconds, PileupInversion};
use crate::error::ReduceResult;
use crate::unpack::ScalerFrames;

/// Instantaneous rates of one element, from one frame of scaler words.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ElementStats {
    /// Measured all-event rate, events per second.
    pub total_rate: f64,
    /// Deadtime correction factor in effect for the frame.
    pub correction_factor: f64,
    /// Raw in-window count rate, events per second.
    pub in_window_rate: f64,
}

/// Per-element live statistics for one frame of raw scaler words.
///
/// A degenerate frame (zero live time) reports zeroed statistics for the
/// affected element instead of NaN, so displays can render it as idle.
pub fn live_element_stats(
    config: &DetectorConfiguration,
    raw_scaler_data: &[i32],
    inversion: &dyn PileupInversion,
) -> ReduceResult<Vec<ElementStats>> {
    let scalers = ScalerFrames::unpack(raw_scaler_data, 1, config.num_elements())?;
    let factors = deadtime::frame_factors(&scalers, 0, config, inversion);

    let stats = (0..config.num_elements())
        .map(|index| {
            let words = scalers.element(0, index);
            let live = live_time_seconds(words);
            let total_rate = words.total_events as f64 / live;
            if total_rate.is_finite() {
                ElementStats {
                    total_rate,
                    correction_factor: factors[index],
                    in_window_rate: words.in_window as f64 / live,
                }
            } else {
                ElementStats::default()
            }
        })
        .collect();
    Ok(stats)
}

// ===== Tests =====
