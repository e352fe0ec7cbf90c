//! Recorder configuration.
//!
//! All knobs that were process-wide globals in earlier recorder generations
//! (debug path, overlaps, tolerance) are explicit configuration here and get
//! passed into the core at construction time.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::Real;

/// Which rings of the generated lattice are recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphMode {
    /// Only the centre ring.
    #[default]
    Center,
    /// The centre ring and its two vertical neighbours.
    Truncated,
    /// Every ring the vertical field of view supports.
    All,
}

/// Target density of the lattice.
///
/// `Double` records the full lattice; `Normal` every other target; `Half`
/// every fourth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Density {
    Half,
    #[default]
    Normal,
    Double,
}

impl Density {
    /// Fraction of the full lattice that is kept.
    pub fn scale(self) -> Real {
        match self {
            Density::Half => 0.25,
            Density::Normal => 0.5,
            Density::Double => 1.0,
        }
    }
}

/// What the selector does with targets the user sweeps past.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipPolicy {
    /// Hold the cursor until the skipped target is eventually visited.
    #[default]
    Wait,
    /// Advance the cursor and count the target as recorded empty.
    MarkEmpty,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("overlap {0} outside [0, 1)")]
    InvalidOverlap(Real),
    #[error("tolerance must be positive, got {0}")]
    InvalidTolerance(Real),
}

/// Recorder configuration, deserialisable from the host application.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub graph_mode: GraphMode,
    pub density: Density,
    /// Record every other target of the generated graph.
    pub half_graph: bool,
    /// Horizontal overlap fraction between adjacent targets of a ring.
    pub h_overlap: Real,
    /// Vertical overlap fraction between adjacent rings.
    pub v_overlap: Real,
    /// Multiplier on the selector tolerance ellipsoid.
    pub tolerance: Real,
    pub skip_policy: SkipPolicy,
    /// Horizontal crop margin of rectified stereo views, in pixels.
    pub stereo_h_buffer: u32,
    /// Vertical crop margin of rectified stereo views, in pixels.
    pub stereo_v_buffer: u32,
    /// When set, intermediate images are written below this path.
    pub debug_path: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            graph_mode: GraphMode::default(),
            density: Density::default(),
            half_graph: false,
            h_overlap: 0.9,
            v_overlap: 0.25,
            tolerance: 1.0,
            skip_policy: SkipPolicy::default(),
            stereo_h_buffer: 0,
            stereo_v_buffer: 0,
            debug_path: None,
        }
    }
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for overlap in [self.h_overlap, self.v_overlap] {
            if !(0.0..1.0).contains(&overlap) {
                return Err(ConfigError::InvalidOverlap(overlap));
            }
        }
        if self.tolerance <= 0.0 {
            return Err(ConfigError::InvalidTolerance(self.tolerance));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RecorderConfig::default();
        config.validate().unwrap();
        assert_eq!(config.graph_mode, GraphMode::Center);
        assert!((config.h_overlap - 0.9).abs() < 1e-12);
    }

    #[test]
    fn rejects_bad_overlap() {
        let config = RecorderConfig {
            h_overlap: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn roundtrips_through_json() {
        let config = RecorderConfig {
            graph_mode: GraphMode::All,
            density: Density::Double,
            tolerance: 2.0,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: RecorderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.graph_mode, GraphMode::All);
        assert_eq!(back.density, Density::Double);
    }
}
