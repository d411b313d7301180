//! RANSAC with a hard iteration cap, adaptive early stopping and cooperative
//! cancellation, usable wherever a [`sample_consensus::Consensus`] is expected.

use rand::{seq::index, RngCore};
use sample_consensus::{Consensus, Estimator, Model};

use crate::reloc::cancel::CancellationToken;

/// What the last call to [`Consensus::model_inliers`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RansacReport {
    /// Hypothesis samples drawn, never more than the iteration cap.
    pub iterations: usize,
    pub inliers: usize,
    /// The token fired before the search finished; no model was returned.
    pub cancelled: bool,
}

pub struct Ransac<R> {
    threshold: f64,
    max_iterations: usize,
    confidence: f64,
    rng: R,
    cancel: CancellationToken,
    report: RansacReport,
}

impl<R: RngCore> Ransac<R> {
    /// `threshold` is compared against [`Model::residual`]; `confidence` in
    /// `[0, 1)` enables early stopping once the probability of having missed an
    /// all-inlier sample drops below `1 - confidence`.
    pub fn new(threshold: f64, max_iterations: usize, confidence: f64, rng: R) -> Self {
        Self {
            threshold,
            max_iterations,
            confidence,
            rng,
            cancel: CancellationToken::new(),
            report: RansacReport::default(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn report(&self) -> RansacReport {
        self.report
    }

    /// Number of samples needed to see one all-inlier sample of `sample_size`
    /// with the configured confidence, given the inlier ratio.
    fn required_iterations(&self, inlier_ratio: f64, sample_size: usize) -> usize {
        if self.confidence <= 0.0 || inlier_ratio <= 0.0 {
            return self.max_iterations;
        }
        let p_fail = (1.0 - inlier_ratio.powi(sample_size as i32)).max(1e-15);
        if p_fail >= 1.0 {
            return self.max_iterations;
        }
        let k = (1.0 - self.confidence).ln() / p_fail.ln();
        (k.ceil().max(1.0) as usize).min(self.max_iterations)
    }
}

impl<E, R, Data> Consensus<E, Data> for Ransac<R>
where
    E: Estimator<Data>,
    R: RngCore,
    Data: Clone,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = Data> + Clone,
    {
        self.model_inliers(estimator, data).map(|(model, _)| model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = Data> + Clone,
    {
        self.report = RansacReport::default();

        let data: Vec<Data> = data.collect();
        let n = data.len();
        if n < E::MIN_SAMPLES || E::MIN_SAMPLES == 0 {
            return None;
        }

        let mut best: Option<(E::Model, Vec<usize>)> = None;
        let mut adaptive_max = self.max_iterations;

        while self.report.iterations < adaptive_max {
            if self.cancel.is_cancelled() {
                log::debug!("ransac cancelled after {} iterations", self.report.iterations);
                self.report.cancelled = true;
                return None;
            }
            self.report.iterations += 1;

            let sample = index::sample(&mut self.rng, n, E::MIN_SAMPLES).into_vec();
            let hypotheses = estimator.estimate(sample.iter().map(|&i| data[i].clone()));

            for model in hypotheses {
                let inliers: Vec<usize> = data
                    .iter()
                    .enumerate()
                    .filter(|(_, datum)| model.residual(datum) < self.threshold)
                    .map(|(i, _)| i)
                    .collect();

                let best_count = best.as_ref().map_or(0, |(_, b)| b.len());
                if inliers.len() > best_count {
                    let ratio = inliers.len() as f64 / n as f64;
                    adaptive_max = self.required_iterations(ratio, E::MIN_SAMPLES);
                    best = Some((model, inliers));
                }
            }
        }

        let (model, inliers) = best?;
        if inliers.len() < E::MIN_SAMPLES {
            return None;
        }
        self.report.inliers = inliers.len();
        Some((model, inliers))
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Rotation3, Vector2, Vector3};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::algorithms::five_point::{rotation_angle, Correspondence, RotationEstimator};

    /// Line `y = a x + b` through two samples.
    struct LineEstimator;
    struct Line(f64, f64);

    impl Model<(f64, f64)> for Line {
        fn residual(&self, &(x, y): &(f64, f64)) -> f64 {
            (y - (self.0 * x + self.1)).abs()
        }
    }

    impl Estimator<(f64, f64)> for LineEstimator {
        const MIN_SAMPLES: usize = 2;
        type Model = Line;
        type ModelIter = Option<Line>;

        fn estimate<I>(&self, mut data: I) -> Self::ModelIter
        where
            I: Iterator<Item = (f64, f64)> + Clone,
        {
            let (x1, y1) = data.next()?;
            let (x2, y2) = data.next()?;
            if (x2 - x1).abs() < 1e-12 {
                return None;
            }
            let slope = (y2 - y1) / (x2 - x1);
            Some(Line(slope, y1 - slope * x1))
        }
    }

    fn noisy_line(inliers: usize, outliers: usize, seed: u64) -> Vec<(f64, f64)> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut points: Vec<(f64, f64)> = (0..inliers)
            .map(|i| {
                let x = i as f64;
                (x, 2.0 * x + 1.0 + rng.gen_range(-1e-4..1e-4))
            })
            .collect();
        points.extend(
            (0..outliers).map(|_| (rng.gen_range(0.0..50.0), rng.gen_range(-100.0..100.0))),
        );
        points
    }

    #[test]
    fn separates_inliers_from_outliers() {
        let points = noisy_line(60, 20, 1);
        let mut ransac = Ransac::new(0.1, 500, 0.999, StdRng::seed_from_u64(7));

        let (line, inliers) = ransac.model_inliers(&LineEstimator, points.iter().copied()).unwrap();

        assert!((line.0 - 2.0).abs() < 0.01 && (line.1 - 1.0).abs() < 0.1);
        assert!(inliers.len() >= 60);
        assert!(inliers.iter().take(60).copied().eq(0..60));
        assert_eq!(ransac.report().inliers, inliers.len());
    }

    #[test]
    fn never_exceeds_iteration_cap() {
        let points = noisy_line(5, 200, 2);
        for cap in [1, 7, 30] {
            let mut ransac = Ransac::new(0.1, cap, 0.999, StdRng::seed_from_u64(3));
            let _ = ransac.model_inliers(&LineEstimator, points.iter().copied());
            assert!(ransac.report().iterations <= cap);
        }
    }

    #[test]
    fn stops_early_on_clean_data() {
        let points = noisy_line(50, 0, 4);
        let mut ransac = Ransac::new(0.1, 1000, 0.99, StdRng::seed_from_u64(5));
        assert!(ransac.model(&LineEstimator, points.iter().copied()).is_some());
        assert!(ransac.report().iterations < 10);
    }

    #[test]
    fn cancelled_token_returns_nothing() {
        let points = noisy_line(50, 10, 6);
        let token = CancellationToken::new();
        token.cancel();

        let mut ransac =
            Ransac::new(0.1, 100, 0.99, StdRng::seed_from_u64(5)).with_cancellation(token);
        assert!(ransac.model_inliers(&LineEstimator, points.iter().copied()).is_none());
        assert!(ransac.report().cancelled);
        assert_eq!(ransac.report().iterations, 0);
    }

    #[test]
    fn too_few_samples() {
        let mut ransac = Ransac::new(0.1, 100, 0.99, StdRng::seed_from_u64(5));
        assert!(ransac.model(&LineEstimator, [(1.0, 2.0)].into_iter()).is_none());
    }

    #[test]
    fn fits_rotation_with_shared_rng() {
        let rotation = Rotation3::from_euler_angles(0.0, 0.2, 0.1);
        let mut rng = StdRng::seed_from_u64(9);
        let data: Vec<Correspondence> = (0..30)
            .map(|_| {
                let p = Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), 5.0);
                let q = rotation * p;
                Correspondence::new(
                    Vector2::new(p.x / p.z, p.y / p.z),
                    Vector2::new(q.x / q.z, q.y / q.z),
                )
            })
            .collect();

        let mut ransac = Ransac::new(1e-3, 50, 0.999, &mut rng);
        let model = ransac.model(&RotationEstimator, data.iter().copied()).unwrap();
        assert!(rotation_angle(&(model.0.inverse() * rotation)) < 1e-6);
    }
}
