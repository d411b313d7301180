use bitarray::BitArray;
use image::GrayImage;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Descriptor length in bytes (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;
const DESCRIPTOR_BITS: usize = DESCRIPTOR_BYTES * u8::BITS as usize;

/// Sample offsets never leave a `(2 * PATCH_RADIUS + 1)` square around the keypoint.
pub const PATCH_RADIUS: i32 = 12;

pub type BinaryDescriptor = BitArray<DESCRIPTOR_BYTES>;

/// Compute BRIEF (Binary Robust Independent Elementary Features) on a given
/// grayscale image given the target keypoint.
///
/// The image should already be smoothed; pixel pairs that fall outside of it
/// compare as `0`, so keypoints closer than [`PATCH_RADIUS`] to the border get
/// weaker descriptors.
pub fn compute_descriptor(x: u32, y: u32, image: &GrayImage) -> BinaryDescriptor {
    const BITS: usize = u8::BITS as _;

    let intensity = |px: i32, py: i32| -> u8 {
        if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height() {
            image.get_pixel(px as u32, py as u32).0[0]
        } else {
            0
        }
    };

    let mut brief_descriptor = [0u8; DESCRIPTOR_BYTES];
    for (i, byte) in brief_descriptor.iter_mut().enumerate() {
        for j in 0..BITS {
            let [p1x, p1y, p2x, p2y] = BRIEF256_SAMPLES[i * BITS + j];

            let first = intensity(x as i32 + p1x, y as i32 + p1y);
            let second = intensity(x as i32 + p2x, y as i32 + p2y);

            if first > second {
                *byte |= 1 << j;
            }
        }
    }

    BitArray::new(brief_descriptor)
}

/// Precomputed sample pairs for the 256 BRIEF tests.
/// The values remain consistent accross frames, because we want to achieve a
/// similar level of entropy to best match our previous encounters with points.
static BRIEF256_SAMPLES: Lazy<[[i32; 4]; DESCRIPTOR_BITS]> = Lazy::new(|| {
    // use reproducible random numbers so that descriptors from different runs agree
    let mut rng = StdRng::seed_from_u64(42);

    // isotropic gaussian with sigma = S / 5 for a patch of side S (Calonder et al.),
    // clamped to the patch
    let sigma = (2 * PATCH_RADIUS + 1) as f64 / 5.0;
    let normal_dist = Normal::new(0.0, sigma).expect("finite positive sigma");
    let mut sample =
        || (normal_dist.sample(&mut rng).round() as i32).clamp(-PATCH_RADIUS, PATCH_RADIUS);

    let mut samples = [[0; 4]; DESCRIPTOR_BITS];
    for pair in samples.iter_mut() {
        *pair = [sample(), sample(), sample(), sample()];
    }

    samples
});
