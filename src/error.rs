//! Custom error types for the reduction engine.
//!
//! This module defines the primary error type, `ReduceError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized way to report
//! the two failure classes the engine distinguishes:
//!
//! - **Configuration errors** (`Configuration`, `RegionOutOfBounds`,
//!   `ConfigParse`, `Io`): the detector description itself is unusable. These
//!   are raised before any frame is touched and abort the whole readout call;
//!   no partial records are ever produced.
//! - **Stream shape errors** (`ScalerLengthMismatch`, `SpectrumLengthMismatch`,
//!   `FluxLengthMismatch`): the raw buffers handed over by the hardware layer
//!   do not match the frame/element/grade geometry the configuration implies.
//!   These also abort the call, since guessing a packing would silently
//!   misattribute counts.
//!
//! Numeric degeneracy inside a frame (zero live time, overflowed counters,
//! non-finite intermediate rates) is deliberately *not* an error: it is
//! recovered in place by the deadtime and extraction code, so one bad element
//! never poisons a multi-frame readout.
//!
//! By using `#[from]`, `ReduceError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the `?`
//! operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ReduceResult<T> = std::result::Result<T, ReduceError>;

/// Errors raised while validating a configuration or unpacking a readout.
#[derive(Error, Debug)]
pub enum ReduceError {
    /// Semantic problem in the detector description.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A region window falls outside the delivered spectrum.
    #[error(
        "Element {element}: region '{name}' spans bins {start}..={end} but the spectrum has {size} bins"
    )]
    RegionOutOfBounds {
        /// Element the offending region belongs to.
        element: usize,
        /// Name of the offending region.
        name: String,
        /// First bin of the window (inclusive).
        start: usize,
        /// Last bin of the window (inclusive).
        end: usize,
        /// Delivered spectrum size the window must fit in.
        size: usize,
    },

    /// Raw scaler buffer length disagrees with the frame geometry.
    #[error(
        "Scaler data length {actual} does not match {expected} ({frames} frames x {elements} elements x 4 words)"
    )]
    ScalerLengthMismatch {
        /// Length of the buffer actually received.
        actual: usize,
        /// Length the geometry requires.
        expected: usize,
        /// Number of frames in the readout.
        frames: usize,
        /// Number of detector elements.
        elements: usize,
    },

    /// Raw spectrum buffer length disagrees with the frame geometry.
    #[error(
        "Spectrum data length {actual} does not match {expected} ({frames} frames x {elements} elements x {grades} grades x {bins} bins)"
    )]
    SpectrumLengthMismatch {
        /// Length of the buffer actually received.
        actual: usize,
        /// Length the geometry requires.
        expected: usize,
        /// Number of frames in the readout.
        frames: usize,
        /// Number of detector elements.
        elements: usize,
        /// Grade rows per element.
        grades: usize,
        /// Bins per grade row.
        bins: usize,
    },

    /// Incident-flux array length disagrees with the frame count.
    #[error("Incident flux array has {actual} entries but the readout has {frames} frames")]
    FluxLengthMismatch {
        /// Length of the flux array actually received.
        actual: usize,
        /// Number of frames in the readout.
        frames: usize,
    },

    /// I/O failure while loading a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file did not parse as TOML.
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Internal array reshape failure.
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}
