use std::collections::HashSet;

use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use nalgebra::Vector2;
use space::{Knn, KnnFromBatch, LinearKnn, Metric};

use crate::{
    algorithms::{
        brief::{self, BinaryDescriptor},
        camera::PinholeCamera,
        five_point::Correspondence,
    },
    config::FeatureConfig,
};

/// Smoothing applied before sampling BRIEF pairs, so descriptors are not
/// overly sensitive to high frequency noise.
const BRIEF_SMOOTHING_SIGMA: f32 = 2.0;

/// Feature object which holds a coordinate/pixel on the image and its
/// binary descriptor
#[derive(Clone)]
pub struct Feature {
    pub keypoint: Vector2<u32>,
    /// Undistorted normalized image coordinates of `keypoint`.
    pub normalized: Vector2<f64>,
    pub descriptor: BinaryDescriptor,
}

/// Features of one frame, kept as the database descriptor of a keyframe.
#[derive(Clone, Default)]
pub struct FeatureSet {
    features: Vec<Feature>,
}

impl FeatureSet {
    /// Uses FAST (Features from Accelerated Segment Test) to find corners,
    /// then BRIEF (Binary Robust Independent Elementary Features) to describe them.
    pub fn extract(image: &GrayImage, camera: &PinholeCamera, config: &FeatureConfig) -> Self {
        let (width, height) = image.dimensions();
        let border = config.border.max(brief::PATCH_RADIUS as u32);
        let inside = |c: &Corner| {
            c.x >= border && c.y >= border && c.x + border < width && c.y + border < height
        };

        let corners: Vec<Corner> = corners_fast9(image, config.fast_threshold)
            .into_iter()
            .filter(inside)
            .collect();

        // keep only the strongest response in each neighbourhood, then the strongest overall
        let mut corners = imageproc::suppress::local_maxima(&corners, config.nms_radius);
        corners.sort_by(|a, b| b.score.total_cmp(&a.score).then((a.y, a.x).cmp(&(b.y, b.x))));
        corners.truncate(config.max_features);

        let smoothed_image = imageproc::filter::gaussian_blur_f32(image, BRIEF_SMOOTHING_SIGMA);

        let features = corners
            .into_iter()
            .map(|Corner { x, y, .. }| Feature {
                keypoint: Vector2::new(x, y),
                normalized: camera.normalize(&Vector2::new(x as f64, y as f64)),
                descriptor: brief::compute_descriptor(x, y, &smoothed_image),
            })
            .collect();

        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    /// One-to-one descriptor matches between a stored keyframe and a query.
    ///
    /// Each query feature takes its 2 nearest reference neighbors in Hamming
    /// space; the match survives an absolute distance gate, Lowe's ratio test,
    /// and the requirement that neither side was already assigned.
    pub fn match_against(
        &self,
        reference: &FeatureSet,
        config: &FeatureConfig,
    ) -> Vec<Correspondence> {
        if reference.is_empty() || self.is_empty() {
            return Vec::new();
        }

        // Prepare feature data to perform kNN matching
        let data = reference.features.iter().map(|f| (f, 1u8)).collect::<Vec<_>>();
        let search: LinearKnn<FeatureHamming, _> = KnnFromBatch::from_batch(data.iter());

        // enforce that each reference point is matched only once
        let mut seen_reference = HashSet::<usize>::new();

        self.features
            .iter()
            .filter_map(|feature| {
                // https://stackoverflow.com/questions/51197091/how-does-the-lowes-ratio-test-work
                let nearest = search.knn(&feature, 2);
                let (best, passes_ratio) = match nearest.as_slice() {
                    [best, second] => (
                        best,
                        (best.0.distance as f32) < config.lowe_ratio * second.0.distance as f32,
                    ),
                    [best] => (best, true),
                    _ => return None,
                };

                if best.0.distance <= config.max_hamming_distance
                    && passes_ratio
                    && seen_reference.insert(best.0.index)
                {
                    let matched: &Feature = best.1;
                    Some(Correspondence::new(matched.normalized, feature.normalized))
                } else {
                    None
                }
            })
            .collect()
    }
}

// Implementations for `space`

#[derive(Default)]
struct FeatureHamming;

impl<'f> Metric<&'f Feature> for FeatureHamming {
    type Unit = u32;
    fn distance(&self, a: &&Feature, b: &&Feature) -> Self::Unit {
        a.descriptor.distance(&b.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    /// Random grey blocks: plenty of corners, distinctive patches.
    fn blocks(width: u32, height: u32, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let cells: Vec<u8> = (0..(width / 8 + 1) * (height / 8 + 1)).map(|_| rng.gen()).collect();
        GrayImage::from_fn(width, height, |x, y| {
            Luma([cells[((y / 8) * (width / 8 + 1) + x / 8) as usize]])
        })
    }

    fn setup() -> (PinholeCamera, FeatureConfig) {
        (PinholeCamera::ideal(200.0, 160, 120).unwrap(), FeatureConfig::default())
    }

    #[test]
    fn extraction_respects_limits() {
        let (camera, mut config) = setup();
        config.max_features = 40;
        let features = FeatureSet::extract(&blocks(160, 120, 1), &camera, &config);

        assert!(!features.is_empty());
        assert!(features.len() <= 40);
        for f in features.iter() {
            assert!(f.keypoint.x >= config.border && f.keypoint.x + config.border < 160);
            assert!(f.keypoint.y >= config.border && f.keypoint.y + config.border < 120);
        }
    }

    #[test]
    fn flat_image_has_no_features() {
        let (camera, config) = setup();
        let flat = GrayImage::from_pixel(160, 120, Luma([90]));
        let features = FeatureSet::extract(&flat, &camera, &config);
        assert!(features.is_empty());
    }

    #[test]
    fn identical_images_match_onto_themselves() {
        let (camera, config) = setup();
        let image = blocks(160, 120, 2);
        let a = FeatureSet::extract(&image, &camera, &config);
        let b = FeatureSet::extract(&image, &camera, &config);

        let matches = b.match_against(&a, &config);
        assert!(matches.len() >= a.len() / 2, "{} of {}", matches.len(), a.len());
        assert!(matches.iter().all(|c| c.reference == c.query));
    }

    #[test]
    fn matches_are_one_to_one() {
        let (camera, config) = setup();
        let a = FeatureSet::extract(&blocks(160, 120, 3), &camera, &config);
        let b = FeatureSet::extract(&blocks(160, 120, 4), &camera, &config);

        let matches = b.match_against(&a, &config);
        let mut references: Vec<_> = matches
            .iter()
            .map(|c| (c.reference.x.to_bits(), c.reference.y.to_bits()))
            .collect();
        references.sort();
        references.dedup();
        assert_eq!(references.len(), matches.len());
    }

    #[test]
    fn empty_sets_do_not_match() {
        let (camera, config) = setup();
        let a = FeatureSet::extract(&blocks(160, 120, 5), &camera, &config);
        assert!(a.match_against(&FeatureSet::default(), &config).is_empty());
        assert!(FeatureSet::default().match_against(&a, &config).is_empty());
    }
}
