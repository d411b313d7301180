//! Appearance-based retrieval of keyframes that may show the same place as a query.

use std::collections::BTreeMap;

use image::{imageops, GrayImage};
use parking_lot::RwLock;

use crate::{
    config::PlaceFinderConfig,
    error::RelocError,
    reloc::frame::{Frame, FrameId},
};

/// A stored keyframe proposed for verification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateMatch {
    pub id: FrameId,
    /// Similarity in `[0, 1]`, higher is more alike.
    pub score: f64,
}

/// Retrieval strategy over keyframe appearance.
pub trait PlaceFinder: Send + Sync {
    /// Make `frame` retrievable by later queries. Indexing an id twice fails
    /// with [`RelocError::DuplicateId`].
    fn index(&self, frame: &Frame) -> Result<(), RelocError>;

    /// Up to `max_candidates` indexed keyframes by descending score, ties going
    /// to the lower id. Never mutates the index.
    fn query(&self, frame: &Frame, max_candidates: usize) -> Vec<CandidateMatch>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whole-image appearance: the coarsest pyramid level shrunk to a small
/// blurred thumbnail, compared by normalized cross-correlation.
pub struct CrossCorrelationPlaceFinder {
    config: PlaceFinderConfig,
    /// `None` marks a textureless thumbnail that matches nothing.
    thumbnails: RwLock<BTreeMap<FrameId, Option<Vec<f32>>>>,
}

impl CrossCorrelationPlaceFinder {
    pub fn new(config: PlaceFinderConfig) -> Self {
        Self {
            config,
            thumbnails: RwLock::new(BTreeMap::new()),
        }
    }

    /// Zero-mean, unit-norm thumbnail of the frame, or `None` if it is flat.
    fn describe(&self, frame: &Frame) -> Option<Vec<f32>> {
        let thumbnail = imageops::resize(
            frame.pyramid().coarsest(),
            self.config.thumbnail_width,
            self.config.thumbnail_height,
            imageops::FilterType::Triangle,
        );
        let thumbnail: GrayImage = if self.config.blur_sigma > 0.0 {
            imageproc::filter::gaussian_blur_f32(&thumbnail, self.config.blur_sigma)
        } else {
            thumbnail
        };

        let mut values: Vec<f32> = thumbnail.pixels().map(|p| p.0[0] as f32).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        values.iter_mut().for_each(|v| *v -= mean);

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-3 {
            return None;
        }
        values.iter_mut().for_each(|v| *v /= norm);
        Some(values)
    }
}

/// `(NCC + 1) / 2`, so anti-correlated images score 0 and identical ones 1.
fn similarity(a: &Option<Vec<f32>>, b: &Option<Vec<f32>>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ncc: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            ((ncc as f64 + 1.0) / 2.0).clamp(0.0, 1.0)
        }
        _ => 0.0,
    }
}

impl PlaceFinder for CrossCorrelationPlaceFinder {
    fn index(&self, frame: &Frame) -> Result<(), RelocError> {
        let descriptor = self.describe(frame);
        if descriptor.is_none() {
            log::warn!(
                "keyframe {} has a textureless thumbnail and will never be retrieved",
                frame.id()
            );
        }

        let mut thumbnails = self.thumbnails.write();
        if thumbnails.contains_key(&frame.id()) {
            return Err(RelocError::DuplicateId(frame.id()));
        }
        thumbnails.insert(frame.id(), descriptor);
        Ok(())
    }

    fn query(&self, frame: &Frame, max_candidates: usize) -> Vec<CandidateMatch> {
        if max_candidates == 0 {
            return Vec::new();
        }
        let descriptor = self.describe(frame);

        let mut candidates: Vec<CandidateMatch> = self
            .thumbnails
            .read()
            .iter()
            .map(|(&id, stored)| CandidateMatch {
                id,
                score: similarity(&descriptor, stored),
            })
            .filter(|candidate| candidate.score >= self.config.min_score)
            .collect();

        // the map iterates ids in ascending order and the sort is stable
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(max_candidates);
        candidates
    }

    fn len(&self) -> usize {
        self.thumbnails.read().len()
    }
}
