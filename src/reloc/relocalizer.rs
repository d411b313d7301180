use std::{sync::Arc, time::Duration};

use nalgebra::Isometry3;
use parking_lot::Mutex;

use crate::{
    algorithms::camera::PinholeCamera,
    config::{RelocalizerConfig, RelocalizerSettings},
    error::RelocError,
    reloc::{
        cancel::CancellationToken,
        frame::{Frame, FrameId, SharedFrame},
        keyframe_db::KeyframeDatabase,
        place_finder::{CandidateMatch, CrossCorrelationPlaceFinder, PlaceFinder},
        relpos_finder::{FivePointRelposFinder, RelativePose, RelposFinder, VerificationFailure},
    },
};

/// Why a relocalization attempt found no pose. None of these are errors: the
/// caller keeps processing frames in the not-yet-relocalized state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// The place finder returned nothing above its score threshold.
    NoCandidate,
    /// Every candidate failed geometric verification.
    NoVerifiedMatch,
    /// The caller cancelled or the time budget ran out.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelocalizationOutcome {
    Found {
        matched_id: FrameId,
        score: f64,
        pose: RelativePose,
        /// `T_keyframe_world` of the matched keyframe.
        keyframe_pose: Isometry3<f64>,
    },
    Miss(MissReason),
}

/// Verification of one candidate during a relocalization call.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateAttempt {
    pub candidate: CandidateMatch,
    pub iterations: usize,
    pub correspondences: usize,
    /// `None` if this candidate was accepted.
    pub failure: Option<VerificationFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelocalizationResult {
    pub outcome: RelocalizationOutcome,
    /// Candidates verified, in the order they were tried.
    pub attempts: Vec<CandidateAttempt>,
}

impl RelocalizationResult {
    fn miss(reason: MissReason, attempts: Vec<CandidateAttempt>) -> Self {
        Self {
            outcome: RelocalizationOutcome::Miss(reason),
            attempts,
        }
    }

    pub fn found(&self) -> bool {
        matches!(self.outcome, RelocalizationOutcome::Found { .. })
    }

    pub fn matched_id(&self) -> Option<FrameId> {
        match self.outcome {
            RelocalizationOutcome::Found { matched_id, .. } => Some(matched_id),
            RelocalizationOutcome::Miss(_) => None,
        }
    }

    pub fn relative_pose(&self) -> Option<&RelativePose> {
        match &self.outcome {
            RelocalizationOutcome::Found { pose, .. } => Some(pose),
            RelocalizationOutcome::Miss(_) => None,
        }
    }

    pub fn miss_reason(&self) -> Option<MissReason> {
        match self.outcome {
            RelocalizationOutcome::Found { .. } => None,
            RelocalizationOutcome::Miss(reason) => Some(reason),
        }
    }

    /// Absolute `T_query_world`, with the keyframe-to-query baseline taken to
    /// be `scale` world units long.
    pub fn query_pose(&self, scale: f64) -> Option<Isometry3<f64>> {
        match &self.outcome {
            RelocalizationOutcome::Found {
                pose,
                keyframe_pose,
                ..
            } => Some(pose.query_pose(keyframe_pose, scale)),
            RelocalizationOutcome::Miss(_) => None,
        }
    }

    /// Total RANSAC iterations spent across all candidates.
    pub fn iterations(&self) -> usize {
        self.attempts.iter().map(|a| a.iterations).sum()
    }
}

/// Keyframe database plus a retrieval and a verification strategy.
///
/// All methods take `&self`: keyframes can be added from one thread while
/// others relocalize. Insertions are serialized; queries see every keyframe
/// whose insertion completed before they started.
pub struct MultipleRelocalizer<P, R: RelposFinder> {
    database: KeyframeDatabase<R::Features>,
    place_finder: P,
    relpos_finder: R,
    settings: RelocalizerSettings,
    writer: Mutex<()>,
}

impl MultipleRelocalizer<CrossCorrelationPlaceFinder, FivePointRelposFinder> {
    /// The reference pipeline: thumbnail cross-correlation retrieval and
    /// 5-point verification. Fails fast on a missing or invalid camera.
    pub fn from_config(config: &RelocalizerConfig) -> Result<Self, RelocError> {
        config.validate()?;
        let camera = config
            .camera
            .as_ref()
            .ok_or_else(|| RelocError::CameraNotConfigured("missing [camera] section".to_owned()))?;
        let camera = PinholeCamera::from_config(camera)?;

        Self::new(
            CrossCorrelationPlaceFinder::new(config.place_finder.clone()),
            FivePointRelposFinder::new(camera, config),
            config.relocalizer.clone(),
        )
    }
}

impl<P: PlaceFinder, R: RelposFinder> MultipleRelocalizer<P, R> {
    pub fn new(
        place_finder: P,
        relpos_finder: R,
        settings: RelocalizerSettings,
    ) -> Result<Self, RelocError> {
        if settings.max_candidates == 0 {
            return Err(RelocError::InvalidConfig(
                "relocalizer.max_candidates must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            database: KeyframeDatabase::new(),
            place_finder,
            relpos_finder,
            settings,
            writer: Mutex::new(()),
        })
    }

    pub fn database(&self) -> &KeyframeDatabase<R::Features> {
        &self.database
    }

    pub fn place_finder(&self) -> &P {
        &self.place_finder
    }

    pub fn relpos_finder(&self) -> &R {
        &self.relpos_finder
    }

    pub fn settings(&self) -> &RelocalizerSettings {
        &self.settings
    }

    /// Store a keyframe and make it retrievable. Returns its database slot.
    ///
    /// The frame is stored before it is indexed, so an indexing failure leaves
    /// it in the database (reachable by id) and is returned to the caller.
    pub fn add_frame(&self, frame: SharedFrame) -> Result<usize, RelocError> {
        let id = frame.id();
        if !frame.is_keyframe() {
            log::warn!("frame {id} passed to add_frame is not a keyframe");
            return Err(RelocError::NotAKeyframe(id));
        }

        let _writer = self.writer.lock();
        if self.database.contains(id) {
            return Err(RelocError::DuplicateId(id));
        }

        let features = self.relpos_finder.extract(&frame);
        let slot = self.database.insert(Arc::clone(&frame), features)?;
        if let Err(e) = self.place_finder.index(&frame) {
            log::error!("keyframe {id} stored in slot {slot} but could not be indexed: {e}");
            return Err(e);
        }

        log::info!("keyframe {id} added ({} stored)", self.database.len());
        Ok(slot)
    }

    pub fn relocalize(&self, query: &Frame) -> RelocalizationResult {
        self.relocalize_with(query, &CancellationToken::new())
    }

    /// Try up to `max_candidates` retrieved keyframes in descending score
    /// order and accept the first that verifies.
    pub fn relocalize_with(
        &self,
        query: &Frame,
        cancel: &CancellationToken,
    ) -> RelocalizationResult {
        let budget = self.settings.time_budget_ms.map(Duration::from_millis);
        let cancel = cancel.child_with_budget(budget);

        let candidates = self.place_finder.query(query, self.settings.max_candidates);
        if candidates.is_empty() {
            log::debug!("frame {}: no place candidates", query.id());
            return RelocalizationResult::miss(MissReason::NoCandidate, Vec::new());
        }

        let query_features = self.relpos_finder.extract(query);
        let mut attempts = Vec::with_capacity(candidates.len());

        for candidate in candidates.into_iter().take(self.settings.max_candidates) {
            if cancel.is_cancelled() {
                return RelocalizationResult::miss(MissReason::Cancelled, attempts);
            }

            let keyframe = match self.database.get(candidate.id) {
                Ok(keyframe) => keyframe,
                Err(e) => {
                    log::warn!("skipping candidate: {e}");
                    continue;
                }
            };

            let verification = self
                .relpos_finder
                .verify(&query_features, &keyframe.descriptor, &cancel);
            attempts.push(CandidateAttempt {
                candidate,
                iterations: verification.iterations,
                correspondences: verification.correspondences,
                failure: verification.outcome.as_ref().err().copied(),
            });

            match verification.outcome {
                Ok(pose) => {
                    log::info!(
                        "frame {} relocalized against keyframe {} (score {:.3}, {}/{} inliers)",
                        query.id(),
                        candidate.id,
                        candidate.score,
                        pose.inlier_count,
                        pose.correspondence_count
                    );
                    return RelocalizationResult {
                        outcome: RelocalizationOutcome::Found {
                            matched_id: candidate.id,
                            score: candidate.score,
                            pose,
                            keyframe_pose: *keyframe.frame.pose(),
                        },
                        attempts,
                    };
                }
                Err(VerificationFailure::Cancelled) => {
                    return RelocalizationResult::miss(MissReason::Cancelled, attempts);
                }
                Err(failure) => {
                    log::debug!(
                        "frame {}: candidate {} rejected: {failure}",
                        query.id(),
                        candidate.id
                    );
                }
            }
        }

        RelocalizationResult::miss(MissReason::NoVerifiedMatch, attempts)
    }
}
