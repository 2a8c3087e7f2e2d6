//! Raw readout stream unpacking.
//!
//! The hardware layer hands over two flat `i32` buffers per readout call:
//!
//! - **scaler data**, four words per element per frame, flattened as
//!   `[frame][element][word]`;
//! - **spectrum data**, one row of bins per grade per element per frame,
//!   flattened as `[frame][element][grade][bin]`.
//!
//! Both buffers actually carry unsigned 32-bit counters squeezed into a
//! signed container, so every word is bit-reinterpreted to `u32` during
//! unpacking and widened before any arithmetic. Length checks happen here
//! and reject the whole call on mismatch; nothing downstream ever sees a
//! partially shaped array.

use ndarray::{Array3, Array4, ArrayView2, ArrayView3, Axis};

use crate::error::{ReduceError, ReduceResult};

/// Hardware scaler words recorded per element per frame.
pub const SCALER_WORDS_PER_ELEMENT: usize = 4;

/// Scaler word index: total detected events.
pub const WORD_TOTAL_EVENTS: usize = 0;
/// Scaler word index: TFG reset counts.
pub const WORD_RESETS: usize = 1;
/// Scaler word index: in-window event counts.
pub const WORD_IN_WINDOW: usize = 2;
/// Scaler word index: TFG clock cycles.
pub const WORD_CLOCK_CYCLES: usize = 3;

/// Reinterpret a signed 32-bit hardware word as the unsigned counter it is.
///
/// Counters that pass `i32::MAX` wrap into negative values on the wire;
/// the bit pattern is preserved, so a plain cast recovers the count.
#[inline]
pub fn reinterpret_unsigned(word: i32) -> u32 {
    word as u32
}

// ===== Scaler frames =====

/// Scaler words for one element in one frame, widened for rate arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardwareScalers {
    /// Total number of detected events.
    pub total_events: u64,
    /// TFG reset counts.
    pub resets: u64,
    /// Events inside the hardware counting window.
    pub in_window: u64,
    /// TFG clock cycles spanned by the frame.
    pub clock_cycles: u64,
}

/// Scaler readout unpacked to `[frame][element][word]`.
#[derive(Clone, Debug)]
pub struct ScalerFrames {
    data: Array3<u32>,
}

impl ScalerFrames {
    /// Unpack a flat scaler buffer, checking its length against the frame
    /// geometry first.
    pub fn unpack(raw: &[i32], num_frames: usize, num_elements: usize) -> ReduceResult<Self> {
        let expected = num_frames * num_elements * SCALER_WORDS_PER_ELEMENT;
        if raw.len() != expected {
            return Err(ReduceError::ScalerLengthMismatch {
                actual: raw.len(),
                expected,
                frames: num_frames,
                elements: num_elements,
            });
        }
        let words: Vec<u32> = raw.iter().copied().map(reinterpret_unsigned).collect();
        let data = Array3::from_shape_vec(
            (num_frames, num_elements, SCALER_WORDS_PER_ELEMENT),
            words,
        )?;
        Ok(Self { data })
    }

    /// Number of frames in the readout.
    pub fn num_frames(&self) -> usize {
        self.data.dim().0
    }

    /// Number of elements per frame.
    pub fn num_elements(&self) -> usize {
        self.data.dim().1
    }

    /// Widened scaler words for one element in one frame.
    pub fn element(&self, frame: usize, element: usize) -> HardwareScalers {
        HardwareScalers {
            total_events: u64::from(self.data[[frame, element, WORD_TOTAL_EVENTS]]),
            resets: u64::from(self.data[[frame, element, WORD_RESETS]]),
            in_window: u64::from(self.data[[frame, element, WORD_IN_WINDOW]]),
            clock_cycles: u64::from(self.data[[frame, element, WORD_CLOCK_CYCLES]]),
        }
    }

    /// Raw (unwidened) words of one frame as `[element][word]`, for
    /// diagnostic passthrough channels.
    pub fn frame_raw(&self, frame: usize) -> ArrayView2<'_, u32> {
        self.data.index_axis(Axis(0), frame)
    }
}

// ===== Spectrum frames =====

/// Spectrum readout unpacked to `[frame][element][grade][bin]`.
#[derive(Clone, Debug)]
pub struct SpectrumFrames {
    data: Array4<u32>,
}

impl SpectrumFrames {
    /// Unpack a flat spectrum buffer, checking its length against the frame
    /// geometry first.
    pub fn unpack(
        raw: &[i32],
        num_frames: usize,
        num_elements: usize,
        num_grades: usize,
        spectrum_size: usize,
    ) -> ReduceResult<Self> {
        let expected = num_frames * num_elements * num_grades * spectrum_size;
        if raw.len() != expected {
            return Err(ReduceError::SpectrumLengthMismatch {
                actual: raw.len(),
                expected,
                frames: num_frames,
                elements: num_elements,
                grades: num_grades,
                bins: spectrum_size,
            });
        }
        let words: Vec<u32> = raw.iter().copied().map(reinterpret_unsigned).collect();
        let data = Array4::from_shape_vec(
            (num_frames, num_elements, num_grades, spectrum_size),
            words,
        )?;
        Ok(Self { data })
    }

    /// Number of frames in the readout.
    pub fn num_frames(&self) -> usize {
        self.data.dim().0
    }

    /// One frame as `[element][grade][bin]`.
    pub fn frame(&self, frame: usize) -> ArrayView3<'_, u32> {
        self.data.index_axis(Axis(0), frame)
    }

    /// One element's grade rows in one frame, as `[grade][bin]`.
    pub fn element(&self, frame: usize, element: usize) -> ArrayView2<'_, u32> {
        self.data
            .index_axis(Axis(0), frame)
            .index_axis_move(Axis(0), element)
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reinterpret_preserves_bit_pattern() {
        assert_eq!(reinterpret_unsigned(0), 0);
        assert_eq!(reinterpret_unsigned(7), 7);
        assert_eq!(reinterpret_unsigned(i32::MAX), 2_147_483_647);
        // Wrapped counters come back as the upper half of the u32 range.
        assert_eq!(reinterpret_unsigned(-1), u32::MAX);
        assert_eq!(reinterpret_unsigned(i32::MIN), 2_147_483_648);
    }

    #[test]
    fn test_scaler_unpack_rejects_wrong_length() {
        let raw = vec![0i32; 31];
        match ScalerFrames::unpack(&raw, 2, 4) {
            Err(ReduceError::ScalerLengthMismatch {
                actual, expected, ..
            }) => {
                assert_eq!(actual, 31);
                assert_eq!(expected, 32);
            }
            other => panic!("expected ScalerLengthMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_scaler_unpack_orders_frames_then_elements() {
        // 2 frames x 2 elements x 4 words, values equal to flat index.
        let raw: Vec<i32> = (0..16).collect();
        let frames = ScalerFrames::unpack(&raw, 2, 2).unwrap();
        assert_eq!(frames.num_frames(), 2);
        assert_eq!(frames.num_elements(), 2);

        let first = frames.element(0, 0);
        assert_eq!(first.total_events, 0);
        assert_eq!(first.resets, 1);
        assert_eq!(first.in_window, 2);
        assert_eq!(first.clock_cycles, 3);

        // Second frame, second element starts at flat index 12.
        let last = frames.element(1, 1);
        assert_eq!(last.total_events, 12);
        assert_eq!(last.clock_cycles, 15);
    }

    #[test]
    fn test_scaler_words_widen_past_i32_range() {
        let raw = vec![-1, 0, -2, 100];
        let frames = ScalerFrames::unpack(&raw, 1, 1).unwrap();
        let words = frames.element(0, 0);
        assert_eq!(words.total_events, u64::from(u32::MAX));
        assert_eq!(words.in_window, u64::from(u32::MAX) - 1);
        assert_eq!(words.clock_cycles, 100);
    }

    #[test]
    fn test_spectrum_unpack_rejects_wrong_length() {
        let raw = vec![0i32; 100];
        assert!(matches!(
            SpectrumFrames::unpack(&raw, 1, 2, 2, 26),
            Err(ReduceError::SpectrumLengthMismatch { expected: 104, .. })
        ));
    }

    #[test]
    fn test_spectrum_unpack_orders_grades_then_bins() {
        // 1 frame x 2 elements x 2 grades x 3 bins, values equal to flat index.
        let raw: Vec<i32> = (0..12).collect();
        let frames = SpectrumFrames::unpack(&raw, 1, 2, 2, 3).unwrap();

        let element0 = frames.element(0, 0);
        assert_eq!(element0[[0, 0]], 0);
        assert_eq!(element0[[0, 2]], 2);
        assert_eq!(element0[[1, 0]], 3);

        let element1 = frames.element(0, 1);
        assert_eq!(element1[[0, 0]], 6);
        assert_eq!(element1[[1, 2]], 11);
    }
}
