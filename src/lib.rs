//! # XRF Readout Reduction Library
//!
//! This crate turns the raw memory buffers of a multi-element fluorescence
//! detector into deadtime-corrected, named data records. It covers the whole
//! reduction path: reinterpreting the signed hardware words, recovering true
//! input rates through pileup inversion, extracting region-of-interest
//! readings under the three resolution-grade modes, and assembling
//! schema-stable per-frame records ready for storage.
//!
//! ## Crate Structure
//!
//! The library is organized into several modules, each with a distinct
//! responsibility:
//!
//! - **`config`**: Detector geometry and calibration loaded from TOML files:
//!   elements, regions of interest, grade mode, and deadtime constants. See
//!   `config::DetectorConfiguration`.
//! - **`unpack`**: Reinterpretation of the flat signed readout buffers as
//!   unsigned scaler words and spectrum counts, shaped into frame arrays.
//! - **`deadtime`**: Live-time accounting and the deadtime correction factor,
//!   with the pileup inversion behind a pluggable trait.
//! - **`extract`**: The per-element region walk that produces corrected
//!   readings, including threshold windowing, cumulative grade sums, and the
//!   synthesized out-of-window residual.
//! - **`assemble`**: Grouping of readings into named channels and the
//!   aggregate channels (`FF`, `FF_bad`, `resgrade_sums`, `allElementSum`).
//! - **`pipeline`**: The `ReductionPipeline` engine that ties the stages
//!   together and reduces frames in parallel.
//! - **`stats`**: Cheap per-element live rate statistics from a single frame
//!   of scaler words.
//! - **`error`**: The custom `ReduceError` enum for centralized error
//!   handling across the crate.

pub mod assemble;
pub mod config;
pub mod deadtime;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod stats;
pub mod unpack;
