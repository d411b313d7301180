//! Geometric verification of a retrieved candidate against the query frame.

use nalgebra::{Isometry3, Matrix2, Rotation3, Translation3, Unit, UnitQuaternion, Vector2, Vector3};
use rand::{rngs::StdRng, SeedableRng};
use sample_consensus::{Consensus, Model};
use thiserror::Error;

use crate::{
    algorithms::{
        camera::{disambiguate_camera_pose, PinholeCamera, NUM_CONFIGURATIONS},
        five_point::{
            align_bearings, refine_essential, rotation_angle, Correspondence, EssentialMatrix,
            FivePointEstimator, RotationEstimator,
        },
        ransac::Ransac,
        triangulation::{projection_matrix, triangulate_linear},
    },
    config::{FeatureConfig, RansacConfig, RelocalizerConfig, RelposConfig},
    reloc::{cancel::CancellationToken, features::FeatureSet, frame::Frame},
};

/// Fewest correspondences the minimal solver accepts.
pub const MIN_CORRESPONDENCES: usize = 5;

/// Least-squares refits of the RANSAC essential matrix over its inliers.
const REFINE_ROUNDS: usize = 2;

/// Motion of the query camera relative to a stored keyframe:
/// `X_query = rotation * X_keyframe + s * translation_direction` for some
/// unknown scale `s > 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativePose {
    pub rotation: Rotation3<f64>,
    /// `None` when the two views share a viewpoint and no baseline exists.
    pub translation_direction: Option<Unit<Vector3<f64>>>,
    pub inlier_count: usize,
    pub correspondence_count: usize,
}

impl RelativePose {
    /// `T_query_world` from the keyframe's `T_keyframe_world`, with the
    /// baseline scaled to `scale` world units.
    pub fn query_pose(&self, keyframe_pose: &Isometry3<f64>, scale: f64) -> Isometry3<f64> {
        let translation = self
            .translation_direction
            .map_or_else(Vector3::zeros, |t| t.into_inner() * scale);
        let relative = Isometry3::from_parts(
            Translation3::from(translation),
            UnitQuaternion::from_rotation_matrix(&self.rotation),
        );
        relative * keyframe_pose
    }

    /// Angle of `rotation` in radians, finite even for the identity.
    pub fn rotation_angle(&self) -> f64 {
        rotation_angle(&self.rotation)
    }
}

/// Geometry that admits no stable relative pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degeneracy {
    /// Correspondences lie on a line (or a point) in one of the views.
    Collinear,
    /// Correspondences are explained by a rotation about the camera center.
    PureRotation,
    /// The essential matrix fits but the rays barely diverge.
    InsufficientParallax,
}

/// Expected ways for a candidate to fail verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    #[error("{correspondences} correspondences, at least 5 needed")]
    DegenerateInput { correspondences: usize },

    #[error("degenerate geometry: {0:?}")]
    Degenerate(Degeneracy),

    #[error("{inliers} inliers, {required} required")]
    VerificationFailed { inliers: usize, required: usize },

    #[error("cancelled")]
    Cancelled,
}

/// Result of verifying one query/candidate pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub outcome: Result<RelativePose, VerificationFailure>,
    /// RANSAC samples drawn over all stages.
    pub iterations: usize,
    pub correspondences: usize,
}

/// Geometric solver strategy.
///
/// Features are extracted once per frame (keyframes at insertion time) and
/// kept by the caller, so verification only has to match and solve.
pub trait RelposFinder: Send + Sync {
    type Features: Send + Sync;

    fn extract(&self, frame: &Frame) -> Self::Features;

    fn verify(
        &self,
        query: &Self::Features,
        candidate: &Self::Features,
        cancel: &CancellationToken,
    ) -> Verification;

    /// Relative pose of `query` with respect to `candidate`.
    fn estimate(&self, query: &Frame, candidate: &Frame) -> Verification {
        let query = self.extract(query);
        let candidate = self.extract(candidate);
        self.verify(&query, &candidate, &CancellationToken::new())
    }
}

/// Calibrated 5-point essential matrix under RANSAC, with a pure-rotation
/// model competing for the same correspondences.
pub struct FivePointRelposFinder {
    camera: PinholeCamera,
    features: FeatureConfig,
    ransac: RansacConfig,
    relpos: RelposConfig,
}

impl FivePointRelposFinder {
    pub fn new(camera: PinholeCamera, config: &RelocalizerConfig) -> Self {
        Self {
            camera,
            features: config.features.clone(),
            ransac: config.ransac.clone(),
            relpos: config.relpos.clone(),
        }
    }

    pub fn camera(&self) -> &PinholeCamera {
        &self.camera
    }

    fn required_inliers(&self, correspondences: usize) -> usize {
        let by_ratio = (self.relpos.min_inlier_ratio * correspondences as f64).ceil() as usize;
        self.relpos.min_inliers.max(by_ratio)
    }

    /// Estimate the relative pose from matched normalized coordinates, with
    /// `reference` in the keyframe and `query` in the frame being relocalized.
    pub fn estimate_from_correspondences(
        &self,
        correspondences: &[Correspondence],
        cancel: &CancellationToken,
    ) -> Verification {
        let n = correspondences.len();
        let mut iterations = 0;
        let finish = |outcome, iterations| Verification {
            outcome,
            iterations,
            correspondences: n,
        };

        if n < MIN_CORRESPONDENCES {
            return finish(Err(VerificationFailure::DegenerateInput { correspondences: n }), 0);
        }
        if is_collinear(correspondences.iter().map(|c| c.reference), self.relpos.min_point_spread)
            || is_collinear(correspondences.iter().map(|c| c.query), self.relpos.min_point_spread)
        {
            return finish(Err(VerificationFailure::Degenerate(Degeneracy::Collinear)), 0);
        }
        if cancel.is_cancelled() {
            return finish(Err(VerificationFailure::Cancelled), 0);
        }

        let threshold = self.relpos.inlier_threshold_px / self.camera.focal();
        let required = self.required_inliers(n);
        let budget = self.ransac.max_iterations;
        let mut rng = StdRng::seed_from_u64(self.ransac.seed);

        // the 2-point rotation model gets at most a quarter of the budget
        let rotation_inliers = {
            let rotation_budget = (budget / 4).max(1);
            let mut ransac =
                Ransac::new(threshold, rotation_budget, self.ransac.confidence, &mut rng)
                    .with_cancellation(cancel.clone());
            let fit = ransac.model_inliers(&RotationEstimator, correspondences.iter().copied());
            iterations += ransac.report().iterations;
            if ransac.report().cancelled {
                return finish(Err(VerificationFailure::Cancelled), iterations);
            }
            fit.map(|(_, inliers)| inliers).unwrap_or_default()
        };

        if rotation_inliers.len() as f64 >= self.relpos.rotation_dominance * n as f64 {
            let outcome = self.without_baseline(correspondences, &rotation_inliers, required);
            return finish(outcome, iterations);
        }

        let remaining = budget.saturating_sub(iterations);
        let essential_fit = {
            let mut ransac = Ransac::new(threshold, remaining, self.ransac.confidence, &mut rng)
                .with_cancellation(cancel.clone());
            let fit = ransac.model_inliers(&FivePointEstimator, correspondences.iter().copied());
            iterations += ransac.report().iterations;
            if ransac.report().cancelled {
                return finish(Err(VerificationFailure::Cancelled), iterations);
            }
            fit
        };

        let Some((essential, inliers)) = essential_fit else {
            log::debug!(
                "no essential matrix after {iterations} iterations over {n} correspondences"
            );
            return finish(
                Err(VerificationFailure::VerificationFailed { inliers: 0, required }),
                iterations,
            );
        };

        let (essential, inliers) = refine(correspondences, essential, inliers, threshold);
        log::debug!(
            "essential {} / rotation {} inliers of {n} correspondences, {iterations} iterations",
            inliers.len(),
            rotation_inliers.len(),
        );

        // the rotation model explains nearly as much as the essential matrix does
        if rotation_inliers.len() as f64 >= self.relpos.rotation_dominance * inliers.len() as f64 {
            let outcome = self.without_baseline(correspondences, &rotation_inliers, required);
            return finish(outcome, iterations);
        }
        if inliers.len() < required {
            return finish(
                Err(VerificationFailure::VerificationFailed {
                    inliers: inliers.len(),
                    required,
                }),
                iterations,
            );
        }

        let inlier_set: Vec<Correspondence> = inliers.iter().map(|&i| correspondences[i]).collect();
        let Some((t_set, r_set)) = essential.pose_configurations() else {
            return finish(
                Err(VerificationFailure::VerificationFailed {
                    inliers: inliers.len(),
                    required,
                }),
                iterations,
            );
        };

        // triangulate the inliers under each configuration and keep the one
        // that puts the most points in front of both cameras
        let x1: Vec<Vector2<f64>> = inlier_set.iter().map(|c| c.reference).collect();
        let x2: Vec<Vector2<f64>> = inlier_set.iter().map(|c| c.query).collect();
        let origin = projection_matrix(&nalgebra::Matrix3::identity(), &Vector3::zeros());
        let x_sets: [Vec<Vector3<f64>>; NUM_CONFIGURATIONS] = std::array::from_fn(|i| {
            let camera = projection_matrix(&r_set[i], &t_set[i]);
            triangulate_linear(&origin, &camera, &x1, &x2).into_iter().flatten().collect()
        });
        let (best, in_front) = disambiguate_camera_pose(&t_set, &r_set, &x_sets);
        let no_parallax = Err(VerificationFailure::Degenerate(Degeneracy::InsufficientParallax));
        if in_front == 0 {
            return finish(no_parallax, iterations);
        }

        let rotation = Rotation3::from_matrix(&r_set[best]);
        let parallax = median_parallax(&rotation, &inlier_set);
        if parallax < self.relpos.min_parallax_deg.to_radians() {
            log::debug!("median parallax {:.3} deg is too small", parallax.to_degrees());
            return finish(no_parallax, iterations);
        }

        finish(
            Ok(RelativePose {
                rotation,
                translation_direction: Some(Unit::new_normalize(t_set[best])),
                inlier_count: inliers.len(),
                correspondence_count: n,
            }),
            iterations,
        )
    }

    /// The views differ by a rotation only: accept it when the camera has not
    /// turned either, otherwise the pose is unobservable from these views.
    fn without_baseline(
        &self,
        correspondences: &[Correspondence],
        inliers: &[usize],
        required: usize,
    ) -> Result<RelativePose, VerificationFailure> {
        if inliers.len() < required {
            return Err(VerificationFailure::VerificationFailed {
                inliers: inliers.len(),
                required,
            });
        }
        let rotation = align_bearings(inliers.iter().map(|&i| correspondences[i])).ok_or(
            VerificationFailure::VerificationFailed {
                inliers: inliers.len(),
                required,
            },
        )?;

        let angle = rotation_angle(&rotation);
        if angle > self.relpos.stationary_rotation_deg.to_radians() {
            log::debug!("pure rotation of {:.2} deg without baseline", angle.to_degrees());
            return Err(VerificationFailure::Degenerate(Degeneracy::PureRotation));
        }

        Ok(RelativePose {
            rotation,
            translation_direction: None,
            inlier_count: inliers.len(),
            correspondence_count: correspondences.len(),
        })
    }
}

impl RelposFinder for FivePointRelposFinder {
    type Features = FeatureSet;

    fn extract(&self, frame: &Frame) -> FeatureSet {
        FeatureSet::extract(frame.pyramid().finest(), &self.camera, &self.features)
    }

    fn verify(
        &self,
        query: &FeatureSet,
        candidate: &FeatureSet,
        cancel: &CancellationToken,
    ) -> Verification {
        let correspondences = query.match_against(candidate, &self.features);
        self.estimate_from_correspondences(&correspondences, cancel)
    }
}

/// Refit `essential` to its inliers while the refit keeps at least as many.
fn refine(
    correspondences: &[Correspondence],
    mut essential: EssentialMatrix,
    mut inliers: Vec<usize>,
    threshold: f64,
) -> (EssentialMatrix, Vec<usize>) {
    for _ in 0..REFINE_ROUNDS {
        let inlier_set: Vec<Correspondence> = inliers.iter().map(|&i| correspondences[i]).collect();
        let Some(refined) = refine_essential(&inlier_set) else {
            break;
        };
        let refined_inliers: Vec<usize> = correspondences
            .iter()
            .enumerate()
            .filter(|(_, c)| refined.residual(c) < threshold)
            .map(|(i, _)| i)
            .collect();
        if refined_inliers.len() < inliers.len() {
            break;
        }
        essential = refined;
        inliers = refined_inliers;
    }
    (essential, inliers)
}

/// Smallest eigenvalue of the 2D scatter of the points falls below `min_spread`.
fn is_collinear(points: impl Iterator<Item = Vector2<f64>> + Clone, min_spread: f64) -> bool {
    let count = points.clone().count() as f64;
    let mean = points.clone().sum::<Vector2<f64>>() / count;
    let covariance = points.fold(Matrix2::zeros(), |acc, p| {
        let d = p - mean;
        acc + d * d.transpose()
    }) / count;

    let (a, b, c) = (covariance[(0, 0)], covariance[(0, 1)], covariance[(1, 1)]);
    let smallest = 0.5 * (a + c) - (0.25 * (a - c) * (a - c) + b * b).sqrt();
    smallest < min_spread
}

/// Median angle between each query ray and its rotated keyframe ray.
fn median_parallax(rotation: &Rotation3<f64>, inliers: &[Correspondence]) -> f64 {
    let mut angles: Vec<f64> = inliers
        .iter()
        .map(|c| (rotation * c.reference_bearing()).angle(&c.query_bearing()))
        .collect();
    if angles.is_empty() {
        return 0.0;
    }
    angles.sort_by(f64::total_cmp);
    angles[angles.len() / 2]
}
