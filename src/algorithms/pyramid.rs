//! Gaussian image pyramids.
//!
//! Every level is blurred and decimated 2× from the one before it; `levels[0]`
//! is the full-resolution image. Feature extraction runs on the finest level,
//! appearance retrieval on the coarsest.

use image::{GrayImage, ImageBuffer};

use crate::error::RelocError;

/// Blur applied before each 2× decimation.
const PYRAMID_SIGMA: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct ImagePyramid {
    levels: Vec<GrayImage>,
}

impl ImagePyramid {
    /// Build `num_levels` levels from a full-resolution image, stopping early
    /// once a level would shrink below one pixel.
    pub fn build(image: GrayImage, num_levels: usize) -> Result<Self, RelocError> {
        if num_levels == 0 {
            return Err(RelocError::InvalidPyramid("zero levels requested".to_owned()));
        }

        let mut levels = Vec::with_capacity(num_levels);
        levels.push(image);
        while levels.len() < num_levels {
            let Some(previous) = levels.last() else { break };
            if previous.width() < 2 || previous.height() < 2 {
                break;
            }
            let blurred = imageproc::filter::gaussian_blur_f32(previous, PYRAMID_SIGMA);
            levels.push(downsample_2x(&blurred));
        }

        Self::from_levels(levels)
    }

    /// Adopt a pyramid computed by the tracking pipeline.
    pub fn from_levels(levels: Vec<GrayImage>) -> Result<Self, RelocError> {
        let Some(finest) = levels.first() else {
            return Err(RelocError::InvalidPyramid("no levels".to_owned()));
        };
        if finest.width() == 0 || finest.height() == 0 {
            return Err(RelocError::InvalidPyramid("finest level is empty".to_owned()));
        }
        for (i, pair) in levels.windows(2).enumerate() {
            let (finer, coarser) = (&pair[0], &pair[1]);
            if coarser.width() == 0
                || coarser.height() == 0
                || coarser.width() > finer.width()
                || coarser.height() > finer.height()
            {
                return Err(RelocError::InvalidPyramid(format!(
                    "level {} ({}x{}) does not shrink level {} ({}x{})",
                    i + 1,
                    coarser.width(),
                    coarser.height(),
                    i,
                    finer.width(),
                    finer.height()
                )));
            }
        }

        Ok(Self { levels })
    }

    pub fn finest(&self) -> &GrayImage {
        &self.levels[0]
    }

    pub fn coarsest(&self) -> &GrayImage {
        &self.levels[self.levels.len() - 1]
    }

    pub fn level(&self, index: usize) -> Option<&GrayImage> {
        self.levels.get(index)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Always false: a pyramid holds at least its finest level.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Keep every other pixel in both directions.
fn downsample_2x(image: &GrayImage) -> GrayImage {
    let width = (image.width() / 2).max(1);
    let height = (image.height() / 2).max(1);
    ImageBuffer::from_fn(width, height, |x, y| *image.get_pixel(2 * x, 2 * y))
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    #[test]
    fn halves_resolution_per_level() {
        let image = GrayImage::from_fn(160, 120, |x, y| Luma([((x * 3 + y * 5) % 256) as u8]));
        let pyramid = ImagePyramid::build(image, 4).unwrap();

        assert_eq!(pyramid.len(), 4);
        assert_eq!(pyramid.finest().dimensions(), (160, 120));
        assert_eq!(pyramid.level(1).unwrap().dimensions(), (80, 60));
        assert_eq!(pyramid.coarsest().dimensions(), (20, 15));
    }

    #[test]
    fn stops_at_single_pixel() {
        let pyramid = ImagePyramid::build(GrayImage::new(4, 4), 10).unwrap();
        assert_eq!(pyramid.len(), 3);
        assert_eq!(pyramid.coarsest().dimensions(), (1, 1));
    }

    #[test]
    fn rejects_malformed_levels() {
        assert!(ImagePyramid::from_levels(Vec::new()).is_err());
        assert!(ImagePyramid::from_levels(vec![GrayImage::new(0, 10)]).is_err());
        let levels = vec![GrayImage::new(10, 10), GrayImage::new(20, 5)];
        assert!(ImagePyramid::from_levels(levels).is_err());
        assert!(ImagePyramid::build(GrayImage::new(8, 8), 0).is_err());
    }
}
