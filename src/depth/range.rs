//! Depth range state and clipping policy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DepthError;

/// Smallest accepted upper limit of a range
pub const MIN_RANGE_MAX: f32 = 0.1;

/// Default metric range limit in metres
pub const DEFAULT_METRIC_MAX: f32 = 10.0;

/// Clamp that tolerates `lo > hi` and NaN input, preferring `lo`
fn clamp(value: f32, lo: f32, hi: f32) -> f32 {
    value.min(hi).max(lo)
}

/// Near/far planes and clip threshold of one depth interpretation.
///
/// Invariant: `0 <= near <= far <= max` and `0 <= clip <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthRange {
    pub near: f32,
    pub far: f32,
    pub max: f32,
    pub clip: f32,
}

impl DepthRange {
    /// Metric range, 0 to 10 metres
    pub fn metric() -> Self {
        Self {
            near: 0.0,
            far: DEFAULT_METRIC_MAX,
            max: DEFAULT_METRIC_MAX,
            clip: 1.0,
        }
    }

    /// Raw range over normalized samples
    pub fn raw() -> Self {
        Self {
            near: 0.0,
            far: 1.0,
            max: 1.0,
            clip: 1.0,
        }
    }

    /// Set the upper limit (absolute), pulling near and far inside it
    pub fn set_max(&mut self, value: f32) {
        self.max = if value.is_nan() { MIN_RANGE_MAX } else { value.max(MIN_RANGE_MAX) };
        self.near = clamp(self.near, 0.0, self.far.min(self.max));
        self.far = clamp(self.far, self.near, self.max);
    }

    /// Set the near plane as a fraction of `max`
    pub fn set_near(&mut self, fraction: f32) {
        self.near = clamp(fraction * self.max, 0.0, self.far);
    }

    /// Set the far plane as a fraction of `max`
    pub fn set_far(&mut self, fraction: f32) {
        self.far = clamp(fraction * self.max, self.near, self.max);
    }

    /// Set the clip threshold in normalized depth
    pub fn set_clip(&mut self, value: f32) {
        self.clip = clamp(value, 0.0, 1.0);
    }

    pub fn is_valid(&self) -> bool {
        0.0 <= self.near
            && self.near <= self.far
            && self.far <= self.max
            && (0.0..=1.0).contains(&self.clip)
    }
}

/// How samples beyond the clip threshold are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClipMode {
    /// Samples at or past the threshold become background
    #[default]
    EraseBack = 0,
    /// Samples before the threshold become background
    EraseFront = 1,
    /// Samples at or past the threshold are held at the threshold
    ClampBack = 2,
    /// Samples before the threshold are held at the threshold
    ClampFront = 3,
}

impl ClipMode {
    pub const ALL: [ClipMode; 4] = [
        ClipMode::EraseBack,
        ClipMode::EraseFront,
        ClipMode::ClampBack,
        ClipMode::ClampFront,
    ];

    /// Map a normalized depth to its clipped output in `[0, 1]`
    #[inline]
    pub fn apply(self, depth: f32, clip: f32) -> f32 {
        match self {
            ClipMode::EraseBack => {
                if depth < clip {
                    depth
                } else {
                    1.0
                }
            }
            ClipMode::EraseFront => {
                if depth >= clip {
                    depth
                } else {
                    1.0
                }
            }
            ClipMode::ClampBack => {
                if depth < clip {
                    depth
                } else {
                    clip
                }
            }
            ClipMode::ClampFront => {
                if depth >= clip {
                    depth
                } else {
                    clip
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClipMode::EraseBack => "erase-back",
            ClipMode::EraseFront => "erase-front",
            ClipMode::ClampBack => "clamp-back",
            ClipMode::ClampFront => "clamp-front",
        }
    }
}

impl TryFrom<u8> for ClipMode {
    type Error = DepthError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ClipMode::ALL
            .get(value as usize)
            .copied()
            .ok_or(DepthError::UnknownClipMode(value))
    }
}

impl FromStr for ClipMode {
    type Err = DepthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClipMode::ALL
            .iter()
            .find(|mode| mode.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| DepthError::UnknownClipModeName(s.to_string()))
    }
}

impl fmt::Display for ClipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_setters_clamp() {
        let mut range = DepthRange::metric();

        range.set_far(0.5);
        assert_eq!(range.far, 5.0);

        range.set_near(0.8);
        assert_eq!(range.near, 5.0);

        range.set_far(0.1);
        assert_eq!(range.far, 5.0);

        range.set_clip(3.0);
        assert_eq!(range.clip, 1.0);
        range.set_clip(-1.0);
        assert_eq!(range.clip, 0.0);

        range.set_max(0.0);
        assert_eq!(range.max, MIN_RANGE_MAX);
        assert!(range.is_valid());
        assert_eq!(range.near, MIN_RANGE_MAX);
        assert_eq!(range.far, MIN_RANGE_MAX);
    }

    #[test]
    fn test_clip_mode_table() {
        assert_eq!(ClipMode::EraseBack.apply(0.3, 0.5), 0.3);
        assert_eq!(ClipMode::EraseBack.apply(0.5, 0.5), 1.0);
        assert_eq!(ClipMode::EraseFront.apply(0.3, 0.5), 1.0);
        assert_eq!(ClipMode::EraseFront.apply(0.5, 0.5), 0.5);
        assert_eq!(ClipMode::ClampBack.apply(0.7, 0.5), 0.5);
        assert_eq!(ClipMode::ClampBack.apply(0.2, 0.5), 0.2);
        assert_eq!(ClipMode::ClampFront.apply(0.2, 0.5), 0.5);
        assert_eq!(ClipMode::ClampFront.apply(0.7, 0.5), 0.7);
    }

    #[test]
    fn test_clip_mode_conversions() {
        assert_eq!(ClipMode::try_from(2).unwrap(), ClipMode::ClampBack);
        assert_eq!(ClipMode::try_from(4).unwrap_err(), DepthError::UnknownClipMode(4));
        assert_eq!("Erase-Front".parse::<ClipMode>().unwrap(), ClipMode::EraseFront);
        assert!("sideways".parse::<ClipMode>().is_err());
    }

    proptest! {
        #[test]
        fn prop_range_invariant_holds(ops in prop::collection::vec((0u8..4, -2.0f32..20.0), 0..40)) {
            let mut range = DepthRange::metric();
            for (op, value) in ops {
                match op {
                    0 => range.set_max(value),
                    1 => range.set_near(value),
                    2 => range.set_far(value),
                    _ => range.set_clip(value),
                }
                prop_assert!(range.is_valid(), "{:?}", range);
            }
        }
    }
}
