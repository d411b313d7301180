//! Relocalizer configuration, read once at start-up and passed down as
//! immutable values.
//!
//! ```toml
//! [camera]
//! width = 752
//! height = 480
//! fx = 458.654
//! fy = 457.296
//! cx = 367.215
//! cy = 248.375
//! distortion = [-0.2834, 0.0740, 0.0002, 0.00002]
//!
//! [relocalizer]
//! max_candidates = 5
//! time_budget_ms = 30
//! policy = "on_tracking_loss"
//! ```
//!
//! Every section except `[camera]` may be omitted and falls back to its defaults.

use std::{fs, path::Path};

use serde::Deserialize;

use crate::{error::RelocError, node::RelocalizationPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelocalizerConfig {
    /// Calibration of the single camera. There is no usable default.
    pub camera: Option<CameraConfig>,
    #[serde(default)]
    pub place_finder: PlaceFinderConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub ransac: RansacConfig,
    #[serde(default)]
    pub relpos: RelposConfig,
    #[serde(default)]
    pub relocalizer: RelocalizerSettings,
}

impl RelocalizerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, RelocError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RelocError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Checks the non-camera sections. The camera is validated when the
    /// [`crate::algorithms::camera::PinholeCamera`] is built from it, so that
    /// a missing camera always reports `CameraNotConfigured`.
    pub fn validate(&self) -> Result<(), RelocError> {
        let invalid = |reason: &str| Err(RelocError::InvalidConfig(reason.to_owned()));

        if self.relocalizer.max_candidates == 0 {
            return invalid("relocalizer.max_candidates must be at least 1");
        }
        // the rotation stage takes a quarter, the essential stage needs the rest
        if self.ransac.max_iterations < 2 {
            return invalid("ransac.max_iterations must be at least 2");
        }
        if !(0.0..1.0).contains(&self.ransac.confidence) {
            return invalid("ransac.confidence must lie in [0, 1)");
        }
        if !(0.0..=1.0).contains(&self.place_finder.min_score) {
            return invalid("place_finder.min_score must lie in [0, 1]");
        }
        if self.place_finder.thumbnail_width == 0 || self.place_finder.thumbnail_height == 0 {
            return invalid("place_finder thumbnail must not be empty");
        }
        if self.relpos.min_inliers < 5 {
            return invalid("relpos.min_inliers must be at least 5");
        }
        if self.relpos.inlier_threshold_px <= 0.0 {
            return invalid("relpos.inlier_threshold_px must be positive");
        }
        if !(0.0..=1.0).contains(&self.relpos.min_inlier_ratio)
            || !(0.0..=1.0).contains(&self.relpos.rotation_dominance)
        {
            return invalid("relpos ratios must lie in [0, 1]");
        }
        if self.relpos.rotation_dominance <= 0.0 {
            return invalid("relpos.rotation_dominance must be positive");
        }
        if self.features.lowe_ratio <= 0.0 || self.features.lowe_ratio > 1.0 {
            return invalid("features.lowe_ratio must lie in (0, 1]");
        }
        Ok(())
    }
}

/// Pinhole intrinsics with optional radial-tangential distortion `[k1, k2, p1, p2]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub distortion: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlaceFinderConfig {
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    /// Blur applied to the thumbnail before correlation, in thumbnail pixels.
    pub blur_sigma: f32,
    /// Candidates scoring below this are dropped before ranking.
    pub min_score: f64,
}

impl Default for PlaceFinderConfig {
    fn default() -> Self {
        Self {
            thumbnail_width: 40,
            thumbnail_height: 30,
            blur_sigma: 0.75,
            min_score: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureConfig {
    pub fast_threshold: u8,
    pub max_features: usize,
    /// Corners closer than this to the image border have no full BRIEF patch.
    pub border: u32,
    pub nms_radius: u32,
    /// Out of 256 descriptor bits.
    pub max_hamming_distance: u32,
    pub lowe_ratio: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            max_features: 500,
            border: 16,
            nms_radius: 3,
            max_hamming_distance: 64,
            lowe_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RansacConfig {
    /// Hard cap on hypotheses per verification, shared by every model fitted.
    pub max_iterations: usize,
    /// Early stop once a better hypothesis is this unlikely.
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            confidence: 0.999,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelposConfig {
    pub inlier_threshold_px: f64,
    pub min_inliers: usize,
    pub min_inlier_ratio: f64,
    pub min_parallax_deg: f64,
    /// Below this, a baseline-free match counts as the keyframe's own viewpoint.
    pub stationary_rotation_deg: f64,
    /// Share of the support a pure rotation must explain to rule out a baseline.
    pub rotation_dominance: f64,
    /// Smallest covariance eigenvalue of the normalized points, per view.
    pub min_point_spread: f64,
}

impl Default for RelposConfig {
    fn default() -> Self {
        Self {
            inlier_threshold_px: 1.5,
            min_inliers: 15,
            min_inlier_ratio: 0.3,
            min_parallax_deg: 1.0,
            stationary_rotation_deg: 1.0,
            rotation_dominance: 0.9,
            min_point_spread: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelocalizerSettings {
    /// Candidates verified per query at most.
    pub max_candidates: usize,
    /// Wall-clock budget for one `relocalize` call.
    pub time_budget_ms: Option<u64>,
    pub policy: RelocalizationPolicy,
}

impl Default for RelocalizerSettings {
    fn default() -> Self {
        Self {
            max_candidates: 5,
            time_budget_ms: None,
            policy: RelocalizationPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EUROC: &str = r#"
        [camera]
        width = 752
        height = 480
        fx = 458.654
        fy = 457.296
        cx = 367.215
        cy = 248.375
        distortion = [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05]

        [relocalizer]
        max_candidates = 3
        time_budget_ms = 25
        policy = "every_frame"
    "#;

    #[test]
    fn parses_sections_and_keeps_defaults() {
        let config = RelocalizerConfig::from_toml_str(EUROC).unwrap();
        let camera = config.camera.unwrap();
        assert_eq!(camera.width, 752);
        assert_eq!(camera.distortion.len(), 4);
        assert_eq!(config.relocalizer.max_candidates, 3);
        assert_eq!(config.relocalizer.time_budget_ms, Some(25));
        assert_eq!(config.relocalizer.policy, RelocalizationPolicy::EveryFrame);
        assert_eq!(config.ransac, RansacConfig::default());
        assert_eq!(config.place_finder, PlaceFinderConfig::default());
    }

    #[test]
    fn camera_section_is_optional_at_parse_time() {
        let config = RelocalizerConfig::from_toml_str("[ransac]\nmax_iterations = 50\n").unwrap();
        assert!(config.camera.is_none());
        assert_eq!(config.ransac.max_iterations, 50);
    }

    #[test]
    fn rejects_zero_candidate_cap() {
        let err =
            RelocalizerConfig::from_toml_str("[relocalizer]\nmax_candidates = 0\n").unwrap_err();
        assert!(matches!(err, RelocError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_settings_that_starve_the_essential_stage() {
        for source in [
            "[relpos]\nrotation_dominance = 0.0\n",
            "[ransac]\nmax_iterations = 1\n",
        ] {
            let err = RelocalizerConfig::from_toml_str(source).unwrap_err();
            assert!(matches!(err, RelocError::InvalidConfig(_)), "{source}");
        }
        assert!(RelocalizerConfig::from_toml_str("[ransac]\nmax_iterations = 2\n").is_ok());
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = RelocalizerConfig::from_toml_str("[ransac]\nmax_iters = 5\n").unwrap_err();
        assert!(matches!(err, RelocError::ConfigParse(_)));
    }
}
