//! Raw depth lookup table
//!
//! The sensor delivers 11-bit disparity-like samples in 16-bit words. Every
//! possible sample is mapped once, when the calibration changes, to a
//! normalized and clipped 16-bit output. Applying the table to a frame is then
//! a masked index per sample.
//!
//! The disparity to metres conversion uses the published Kinect fit
//! `z = 1 / (k1 - k2 * raw)`.

use crate::depth::range::{ClipMode, DepthRange};
use crate::frame::FrameBuffer;

/// One entry per possible 11-bit sample
pub const DEPTH_TABLE_SIZE: usize = 2048;

/// Mask selecting the 11 significant bits of a raw sample
pub const RAW_DEPTH_MASK: u16 = 0x07FF;

const K1: f32 = 3.260_443_2;
const K2: f32 = 0.002_995_466;

/// Largest raw sample value
const RAW_MAX: f32 = (DEPTH_TABLE_SIZE - 1) as f32;

/// `1 / x`, saturating to `±max` (sign of `x`) when `x` is within epsilon of zero
#[inline]
pub fn reciprocal(x: f32, max: f32) -> f32 {
    if x.abs() <= f32::EPSILON {
        if x < 0.0 {
            -max
        } else {
            max
        }
    } else {
        1.0 / x
    }
}

/// Precomputed raw sample to calibrated output mapping
#[derive(Clone, PartialEq, Eq)]
pub struct DepthTable {
    entries: Box<[u16; DEPTH_TABLE_SIZE]>,
}

impl DepthTable {
    /// Build the full table for one calibration
    pub fn build(range: &DepthRange, mode: ClipMode, linear: bool) -> Self {
        let mut entries = Box::new([0u16; DEPTH_TABLE_SIZE]);
        let scale = reciprocal(range.far - range.near, f32::MAX);

        for (index, entry) in entries.iter_mut().enumerate() {
            let raw = index as f32;
            let z = if linear {
                reciprocal((K1 - K2 * raw).max(0.0), f32::MAX)
            } else {
                raw / RAW_MAX
            };

            let normalized = ((z - range.near) * scale).clamp(0.0, 1.0);
            let output = mode.apply(normalized, range.clip);
            *entry = (output * 65535.0).round() as u16;
        }

        Self { entries }
    }

    /// Calibrated output for a raw sample; bits above the 11th are ignored
    #[inline]
    pub fn lookup(&self, raw: u16) -> u16 {
        self.entries[(raw & RAW_DEPTH_MASK) as usize]
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.entries[..]
    }

    /// Replace every sample of a depth buffer with its table entry
    pub fn apply(&self, buffer: &mut FrameBuffer) {
        buffer.map_samples(|raw| self.lookup(raw));
    }
}

impl std::fmt::Debug for DepthTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepthTable")
            .field("first", &self.entries[0])
            .field("last", &self.entries[DEPTH_TABLE_SIZE - 1])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PixelFormat, Resolution};
    use proptest::prelude::*;

    fn unit_range(clip: f32) -> DepthRange {
        DepthRange {
            near: 0.0,
            far: 1.0,
            max: 1.0,
            clip,
        }
    }

    #[test]
    fn test_clamp_back_round_trip() {
        let table = DepthTable::build(&unit_range(0.5), ClipMode::ClampBack, false);

        for i in 0..DEPTH_TABLE_SIZE {
            let z = i as f32 / 2047.0;
            let expected = if z >= 0.5 {
                32768
            } else {
                (z * 65535.0).round() as u16
            };
            assert_eq!(table.as_slice()[i], expected, "index {}", i);
        }
    }

    #[test]
    fn test_erase_back_boundary() {
        let table = DepthTable::build(&unit_range(0.5), ClipMode::EraseBack, false);

        for i in 0..DEPTH_TABLE_SIZE {
            let z = i as f32 / 2047.0;
            let expected = if z >= 0.5 {
                65535
            } else {
                (z * 65535.0).round() as u16
            };
            assert_eq!(table.lookup(i as u16), expected, "index {}", i);
        }
    }

    #[test]
    fn test_front_modes_mirror_back_modes() {
        let erase = DepthTable::build(&unit_range(0.25), ClipMode::EraseFront, false);
        let clamp = DepthTable::build(&unit_range(0.25), ClipMode::ClampFront, false);

        assert_eq!(erase.lookup(0), 65535);
        assert_eq!(clamp.lookup(0), (0.25f32 * 65535.0).round() as u16);
        assert_eq!(erase.lookup(2047), 65535);
        assert_eq!(clamp.lookup(2047), 65535);
        assert_eq!(erase.lookup(1024), clamp.lookup(1024));
    }

    #[test]
    fn test_linear_is_monotone_until_saturation() {
        let range = DepthRange::metric();
        let table = DepthTable::build(&range, ClipMode::EraseBack, true);
        let entries = table.as_slice();

        assert!(entries.windows(2).all(|w| w[0] <= w[1]));
        // Past k1 / k2 the denominator is clamped to zero and saturates
        assert_eq!(entries[DEPTH_TABLE_SIZE - 1], 65535);
        // Raw 0 is about 0.31 m out of a 10 m range
        assert!(entries[0] > 1500 && entries[0] < 2500);
    }

    #[test]
    fn test_degenerate_range_saturates() {
        let range = DepthRange {
            near: 0.5,
            far: 0.5,
            max: 1.0,
            clip: 1.0,
        };
        let table = DepthTable::build(&range, ClipMode::EraseBack, false);

        assert_eq!(table.lookup(0), 0);
        assert_eq!(table.lookup(1023), 0);
        assert_eq!(table.lookup(1024), 65535);
    }

    #[test]
    fn test_reciprocal() {
        assert_eq!(reciprocal(4.0, 100.0), 0.25);
        assert_eq!(reciprocal(0.0, 100.0), 100.0);
        assert_eq!(reciprocal(-0.0, 100.0), 100.0);
        assert_eq!(reciprocal(-f32::EPSILON / 2.0, 100.0), -100.0);
    }

    #[test]
    fn test_apply_masks_high_bits() {
        let table = DepthTable::build(&unit_range(1.0), ClipMode::ClampBack, false);
        let mut buffer = FrameBuffer::new();
        buffer.create(Resolution::new(3, 1), PixelFormat::Depth).unwrap();
        buffer.write_samples(&[0, 2047, 0xF800 | 1023]);

        table.apply(&mut buffer);
        assert_eq!(buffer.sample(0), Some(table.lookup(0)));
        assert_eq!(buffer.sample(1), Some(table.lookup(2047)));
        assert_eq!(buffer.sample(2), Some(table.lookup(1023)));
    }

    proptest! {
        #[test]
        fn prop_linear_erase_back_is_monotone(
            max in 0.1f32..20.0,
            near in 0.0f32..1.0,
            far in 0.0f32..1.0,
        ) {
            let mut range = DepthRange::metric();
            range.set_max(max);
            range.set_far(far);
            range.set_near(near);
            let table = DepthTable::build(&range, ClipMode::EraseBack, true);

            prop_assert!(table.as_slice().windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
