use nalgebra::{Matrix3, Vector2, Vector3};

use crate::{config::CameraConfig, error::RelocError};

/// Rotation and translation candidates decomposed from one essential matrix.
pub const NUM_CONFIGURATIONS: usize = 4;

/// Fixed-point iterations used to invert the distortion model.
const UNDISTORT_ITERATIONS: usize = 10;

/// Pinhole camera with radial-tangential distortion.
///
/// Immutable once built: the relative pose finder normalizes every keypoint
/// through the same instance for the lifetime of the relocalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct PinholeCamera {
    width: u32,
    height: u32,
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    /// `[k1, k2, p1, p2]`, all zero when the lens is undistorted.
    distortion: [f64; 4],
}

impl PinholeCamera {
    pub fn from_config(config: &CameraConfig) -> Result<Self, RelocError> {
        let fail = |reason: String| Err(RelocError::CameraNotConfigured(reason));

        if config.width == 0 || config.height == 0 {
            return fail(format!("resolution {}x{}", config.width, config.height));
        }
        for (name, value) in [("fx", config.fx), ("fy", config.fy)] {
            if !value.is_finite() || value <= 0.0 {
                return fail(format!("{name} = {value}"));
            }
        }
        if !config.cx.is_finite() || !config.cy.is_finite() {
            return fail("principal point is not finite".to_owned());
        }
        if config.distortion.len() > 4 || config.distortion.iter().any(|d| !d.is_finite()) {
            return fail(format!("distortion {:?}", config.distortion));
        }

        let mut distortion = [0.0; 4];
        distortion[..config.distortion.len()].copy_from_slice(&config.distortion);

        Ok(Self {
            width: config.width,
            height: config.height,
            fx: config.fx,
            fy: config.fy,
            cx: config.cx,
            cy: config.cy,
            distortion,
        })
    }

    /// Undistorted camera with the principal point at the image center.
    pub fn ideal(focal: f64, width: u32, height: u32) -> Result<Self, RelocError> {
        Self::from_config(&CameraConfig {
            width,
            height,
            fx: focal,
            fy: focal,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
            distortion: Vec::new(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Camera Intrinsic `3x3` Matrix known as `K`
    pub fn intrinsic(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Mean focal length, used to turn pixel thresholds into normalized ones.
    pub fn focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }

    /// Pixel → undistorted normalized image coordinates `(x, y)` on the `z = 1` plane.
    pub fn normalize(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let distorted = Vector2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy);
        if self.distortion.iter().all(|&d| d == 0.0) {
            return distorted;
        }

        // invert the forward model by fixed-point iteration
        let mut point = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            let (radial, tangential) = self.distortion_terms(&point);
            point = (distorted - tangential) / radial;
        }
        point
    }

    /// Normalized coordinates → distorted pixel.
    pub fn project(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        let (radial, tangential) = self.distortion_terms(normalized);
        let distorted = normalized * radial + tangential;
        Vector2::new(self.fx * distorted.x + self.cx, self.fy * distorted.y + self.cy)
    }

    fn distortion_terms(&self, point: &Vector2<f64>) -> (f64, Vector2<f64>) {
        let [k1, k2, p1, p2] = self.distortion;
        let (x, y) = (point.x, point.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        let tangential = Vector2::new(
            2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        );
        (radial, tangential)
    }
}

/// Determines which Camera Pose is correct by evaluating the [Cheirality Condition](http://users.cecs.anu.edu.au/~hartley/Papers/cheiral/revision/cheiral.pdf),
/// which is defined as when the transformed point lies in front of the camera.
///
/// Each configuration `i` maps first-camera coordinates into the second camera
/// as `X' = r_set[i] * X + t_set[i]`, and `x_sets[i]` holds the points
/// triangulated under that configuration, expressed in the first camera.
///
/// Returns the index of the winning configuration and the number of points in
/// front of both cameras.
pub fn disambiguate_camera_pose(
    t_set: &[Vector3<f64>; NUM_CONFIGURATIONS],
    r_set: &[Matrix3<f64>; NUM_CONFIGURATIONS],
    x_sets: &[Vec<Vector3<f64>>; NUM_CONFIGURATIONS],
) -> (usize, usize) {
    // compute the score for the set of points belonging to each configuration,
    // and then return the group with the most points in front of the camera views.
    let mut max_satisfied = (0, 0);
    for i in 0..NUM_CONFIGURATIONS {
        let t = t_set[i];
        let r = r_set[i];

        let score = x_sets[i].iter().fold(0, |score, x| {
            let x_prime_z = (r * x).z + t.z;
            if x.z > 0.0 && x_prime_z > 0.0 {
                score + 1
            } else {
                score
            }
        });

        if score > max_satisfied.1 {
            max_satisfied = (i, score);
        }
    }

    max_satisfied
}
