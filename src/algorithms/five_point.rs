//! Calibrated two-view geometry as `sample_consensus` estimators.
//!
//! [`FivePointEstimator`] is the minimal essential-matrix solver of Stewénius,
//! Engels and Nistér ("Recent developments on direct relative orientation",
//! 2006): the 5 epipolar constraints leave a 4-dimensional null space
//! `E = xX + yY + zZ + W`, the rank and trace constraints give 10 cubics in
//! `(x, y, z)`, and Gauss-Jordan elimination of their 10 cubic monomials yields
//! the action matrix of multiplication by `z` on the 10 monomials of degree ≤ 2.
//! Its real eigenvalues are the up to 10 solutions.
//!
//! [`RotationEstimator`] fits a pure rotation (no baseline) to bearing pairs and
//! is used to detect correspondences that carry no translation information.

use nalgebra::{Matrix3, Rotation3, RowVector3, SMatrix, UnitQuaternion, Vector2, Vector3};
use sample_consensus::{Estimator, Model};

/// Epipolar residual returned when a correspondence lies on the epipole.
const DEGENERATE_RESIDUAL: f64 = f64::MAX;

/// Relative imaginary part below which an eigenvalue counts as real.
const REAL_EIGENVALUE_TOLERANCE: f64 = 1e-8;

/// Bounds the Schur decomposition of the action matrix.
const MAX_SCHUR_ITERATIONS: usize = 10_000;

/// One point seen in both views, in undistorted normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Coordinates in the reference (stored keyframe) view.
    pub reference: Vector2<f64>,
    /// Coordinates in the query view.
    pub query: Vector2<f64>,
}

impl Correspondence {
    pub fn new(reference: Vector2<f64>, query: Vector2<f64>) -> Self {
        Self { reference, query }
    }

    pub fn reference_homogeneous(&self) -> Vector3<f64> {
        self.reference.push(1.0)
    }

    pub fn query_homogeneous(&self) -> Vector3<f64> {
        self.query.push(1.0)
    }

    pub fn reference_bearing(&self) -> Vector3<f64> {
        self.reference_homogeneous().normalize()
    }

    pub fn query_bearing(&self) -> Vector3<f64> {
        self.query_homogeneous().normalize()
    }
}

/// Essential matrix `E = [t]x R` with `query^T E reference = 0`, for the motion
/// `X_query = R X_reference + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EssentialMatrix(pub Matrix3<f64>);

impl EssentialMatrix {
    /// Convert from Essential Matrix to the four `(t, R)` configurations.
    ///
    /// Exactly one of them puts the scene in front of both cameras; see
    /// [`crate::algorithms::camera::disambiguate_camera_pose`].
    /// Reference: Hartley & Zisserman, Multiple View Geometry, result 9.19.
    pub fn pose_configurations(&self) -> Option<([Vector3<f64>; 4], [Matrix3<f64>; 4])> {
        let matrix_w = Matrix3::from_rows(&[
            RowVector3::new(0.0, -1.0, 0.0),
            RowVector3::new(1.0, 0.0, 0.0),
            RowVector3::new(0.0, 0.0, 1.0),
        ]);

        let svd = self.0.svd(true, true);
        let mut matrix_u = svd.u?;
        let mut matrix_v_t = svd.v_t?;

        // E is only defined up to sign, so both factors can be made proper rotations
        if matrix_u.determinant() < 0.0 {
            matrix_u = -matrix_u;
        }
        if matrix_v_t.determinant() < 0.0 {
            matrix_v_t = -matrix_v_t;
        }

        // R = U W V_T  or  U W_T V_T
        let rotation1 = matrix_u * matrix_w * matrix_v_t;
        let rotation2 = matrix_u * matrix_w.transpose() * matrix_v_t;

        // t = u_3 where: U[u_1, u_2, u_3]
        let camera_t = matrix_u.column(2).clone_owned();

        Some((
            [camera_t, -camera_t, camera_t, -camera_t],
            [rotation1, rotation1, rotation2, rotation2],
        ))
    }

    /// Singular values sorted in descending order. A valid essential matrix has
    /// two equal values and a zero.
    pub fn singular_values(&self) -> Vector3<f64> {
        self.0.singular_values()
    }
}

impl Model<Correspondence> for EssentialMatrix {
    /// Square root of the Sampson distance, a first-order approximation of the
    /// reprojection error in normalized image units.
    fn residual(&self, data: &Correspondence) -> f64 {
        let x1 = data.reference_homogeneous();
        let x2 = data.query_homogeneous();

        let ex1 = self.0 * x1;
        let et_x2 = self.0.transpose() * x2;
        let numerator = x2.dot(&ex1);
        let denominator = ex1.x * ex1.x + ex1.y * ex1.y + et_x2.x * et_x2.x + et_x2.y * et_x2.y;

        if denominator < 1e-30 {
            return DEGENERATE_RESIDUAL;
        }
        numerator.abs() / denominator.sqrt()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FivePointEstimator;

impl Estimator<Correspondence> for FivePointEstimator {
    const MIN_SAMPLES: usize = 5;
    type Model = EssentialMatrix;
    type ModelIter = Vec<EssentialMatrix>;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = Correspondence> + Clone,
    {
        let mut samples = [Correspondence::new(Vector2::zeros(), Vector2::zeros()); 5];
        let mut count = 0;
        for (slot, correspondence) in samples.iter_mut().zip(data) {
            *slot = correspondence;
            count += 1;
        }
        if count < Self::MIN_SAMPLES {
            return Vec::new();
        }
        five_point(&samples)
    }
}

/// All real essential matrices consistent with five correspondences, each
/// scaled to unit Frobenius norm.
pub fn five_point(samples: &[Correspondence; 5]) -> Vec<EssentialMatrix> {
    let Some(basis) = null_space_basis(samples) else {
        return Vec::new();
    };
    let constraints = cubic_constraints(&basis);

    // Gauss-Jordan on the cubic block: [C | L] -> [I | C^-1 L]
    let cubic = constraints.fixed_columns::<10>(0).into_owned();
    let lower = constraints.fixed_columns::<10>(10).into_owned();
    let Some(reduced) = cubic.lu().solve(&lower) else {
        return Vec::new();
    };

    // action matrix of multiplication by z on the basis monomials:
    // row i holds z * B_i expressed in the basis
    let mut action = SMatrix::<f64, 10, 10>::zeros();
    for (i, &(a, b, c)) in MONOMIALS[10..].iter().enumerate() {
        match monomial_index(a, b, c + 1) {
            Some(k) if k >= 10 => action[(i, k - 10)] = 1.0,
            Some(k) => action.set_row(i, &(-reduced.row(k))),
            None => return Vec::new(),
        }
    }

    let Some(schur) = action.try_schur(f64::EPSILON, MAX_SCHUR_ITERATIONS) else {
        return Vec::new();
    };

    let mut solutions = Vec::new();
    for eigenvalue in schur.complex_eigenvalues().iter() {
        if eigenvalue.im.abs() > REAL_EIGENVALUE_TOLERANCE * eigenvalue.re.abs().max(1.0) {
            continue;
        }
        let z = eigenvalue.re;

        // monomial vector of this solution = null vector of (action - zI)
        let shifted = action - SMatrix::<f64, 10, 10>::identity() * z;
        let Some(v_t) = shifted.svd(false, true).v_t else {
            continue;
        };
        let monomials = v_t.row(9);
        if monomials[BASIS_ONE].abs() < 1e-12 {
            continue;
        }
        let x = monomials[BASIS_X] / monomials[BASIS_ONE];
        let y = monomials[BASIS_Y] / monomials[BASIS_ONE];

        let essential = basis[0] * x + basis[1] * y + basis[2] * z + basis[3];
        let norm = essential.norm();
        if norm.is_finite() && norm > 1e-12 {
            solutions.push(EssentialMatrix(essential / norm));
        }
    }
    solutions
}

/// Monomials of degree ≤ 3 in `(x, y, z)`: the ten cubics first, then the ten
/// basis monomials of the quotient ring.
const MONOMIALS: [(u8, u8, u8); 20] = [
    (3, 0, 0),
    (2, 1, 0),
    (2, 0, 1),
    (1, 2, 0),
    (1, 1, 1),
    (1, 0, 2),
    (0, 3, 0),
    (0, 2, 1),
    (0, 1, 2),
    (0, 0, 3),
    (2, 0, 0),
    (1, 1, 0),
    (1, 0, 1),
    (0, 2, 0),
    (0, 1, 1),
    (0, 0, 2),
    (1, 0, 0),
    (0, 1, 0),
    (0, 0, 1),
    (0, 0, 0),
];

/// Positions of `x`, `y` and `1` among the basis monomials `MONOMIALS[10..]`.
const BASIS_X: usize = 6;
const BASIS_Y: usize = 7;
const BASIS_ONE: usize = 9;

type Poly = [f64; 20];

fn monomial_index(a: u8, b: u8, c: u8) -> Option<usize> {
    MONOMIALS.iter().position(|&m| m == (a, b, c))
}

fn poly_mul(p: &Poly, q: &Poly) -> Poly {
    let mut product = [0.0; 20];
    for (i, &a) in p.iter().enumerate().filter(|(_, a)| **a != 0.0) {
        for (j, &b) in q.iter().enumerate().filter(|(_, b)| **b != 0.0) {
            let (ea, eb) = (MONOMIALS[i], MONOMIALS[j]);
            if let Some(k) = monomial_index(ea.0 + eb.0, ea.1 + eb.1, ea.2 + eb.2) {
                product[k] += a * b;
            }
        }
    }
    product
}

fn poly_add(p: &Poly, q: &Poly, scale: f64) -> Poly {
    let mut sum = *p;
    for (s, b) in sum.iter_mut().zip(q) {
        *s += scale * b;
    }
    sum
}

/// Four `3x3` matrices spanning the null space of the 5 epipolar constraints,
/// ordered `[X, Y, Z, W]`.
fn null_space_basis(samples: &[Correspondence; 5]) -> Option<[Matrix3<f64>; 4]> {
    // row-major vec(E): query_i * reference_j multiplies E_ij; padded to 9x9 so
    // the SVD yields the full right singular basis
    let mut constraints = SMatrix::<f64, 9, 9>::zeros();
    for (row, sample) in samples.iter().enumerate() {
        let (reference, query) = (sample.reference_homogeneous(), sample.query_homogeneous());
        for i in 0..3 {
            for j in 0..3 {
                constraints[(row, 3 * i + j)] = query[i] * reference[j];
            }
        }
    }

    let v_t = constraints.svd(false, true).v_t?;
    let vector_to_matrix = |row: usize| Matrix3::from_fn(|i, j| v_t[(row, 3 * i + j)]);
    Some([
        vector_to_matrix(5),
        vector_to_matrix(6),
        vector_to_matrix(7),
        vector_to_matrix(8),
    ])
}

/// The 10 cubic constraints `det(E) = 0` and `2 E E^T E - tr(E E^T) E = 0`,
/// one row per equation, columns ordered as [`MONOMIALS`].
fn cubic_constraints(basis: &[Matrix3<f64>; 4]) -> SMatrix<f64, 10, 20> {
    let (x, y, z, one) = (
        monomial_index(1, 0, 0),
        monomial_index(0, 1, 0),
        monomial_index(0, 0, 1),
        monomial_index(0, 0, 0),
    );

    let mut e = [[[0.0; 20]; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            for (index, matrix) in [x, y, z, one].into_iter().zip(basis) {
                if let Some(index) = index {
                    e[i][j][index] = matrix[(i, j)];
                }
            }
        }
    }

    let determinant = {
        let minor = |a: (usize, usize), b: (usize, usize), c: (usize, usize), d: (usize, usize)| {
            poly_add(
                &poly_mul(&e[a.0][a.1], &e[b.0][b.1]),
                &poly_mul(&e[c.0][c.1], &e[d.0][d.1]),
                -1.0,
            )
        };
        let m0 = poly_mul(&e[0][0], &minor((1, 1), (2, 2), (1, 2), (2, 1)));
        let m1 = poly_mul(&e[0][1], &minor((1, 0), (2, 2), (1, 2), (2, 0)));
        let m2 = poly_mul(&e[0][2], &minor((1, 0), (2, 1), (1, 1), (2, 0)));
        poly_add(&poly_add(&m0, &m1, -1.0), &m2, 1.0)
    };

    let mut eet = [[[0.0; 20]; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            for k in 0..3 {
                eet[i][j] = poly_add(&eet[i][j], &poly_mul(&e[i][k], &e[j][k]), 1.0);
            }
        }
    }
    let trace = poly_add(&poly_add(&eet[0][0], &eet[1][1], 1.0), &eet[2][2], 1.0);

    let mut rows = SMatrix::<f64, 10, 20>::zeros();
    rows.set_row(0, &SMatrix::<f64, 1, 20>::from_row_slice(&determinant));
    for i in 0..3 {
        for j in 0..3 {
            let mut eete = [0.0; 20];
            for k in 0..3 {
                eete = poly_add(&eete, &poly_mul(&eet[i][k], &e[k][j]), 1.0);
            }
            let doubled = poly_add(&[0.0; 20], &eete, 2.0);
            let constraint = poly_add(&doubled, &poly_mul(&trace, &e[i][j]), -1.0);
            rows.set_row(1 + 3 * i + j, &SMatrix::<f64, 1, 20>::from_row_slice(&constraint));
        }
    }
    rows
}

/// A rotation-only motion `bearing_query ∝ R bearing_reference`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationModel(pub Rotation3<f64>);

impl Model<Correspondence> for RotationModel {
    /// Angle in radians between the rotated reference bearing and the query bearing.
    fn residual(&self, data: &Correspondence) -> f64 {
        let rotated = self.0 * data.reference_bearing();
        let query = data.query_bearing();
        rotated.cross(&query).norm().atan2(rotated.dot(&query))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RotationEstimator;

impl Estimator<Correspondence> for RotationEstimator {
    const MIN_SAMPLES: usize = 2;
    type Model = RotationModel;
    type ModelIter = Option<RotationModel>;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = Correspondence> + Clone,
    {
        align_bearings(data).map(RotationModel)
    }
}

/// Least-squares rotation taking reference bearings onto query bearings (Kabsch).
pub fn align_bearings<I>(data: I) -> Option<Rotation3<f64>>
where
    I: Iterator<Item = Correspondence>,
{
    let mut covariance = Matrix3::zeros();
    let mut count = 0;
    for correspondence in data {
        covariance +=
            correspondence.reference_bearing() * correspondence.query_bearing().transpose();
        count += 1;
    }
    if count < 2 {
        return None;
    }

    let svd = covariance.svd(true, true);
    let matrix_u = svd.u?;
    let matrix_v = svd.v_t?.transpose();
    let sign = (matrix_v * matrix_u.transpose()).determinant().signum();
    let correction = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, sign));

    Some(Rotation3::from_matrix(&(matrix_v * correction * matrix_u.transpose())))
}

/// Rotation angle in radians, stable at and near the identity where
/// `acos((trace - 1) / 2)` can leave its domain by an ulp.
pub fn rotation_angle(rotation: &Rotation3<f64>) -> f64 {
    UnitQuaternion::from_rotation_matrix(rotation).angle()
}

/// Least-squares essential matrix over many correspondences: the linear
/// 8-point system `x2^T E x1 = 0`, projected onto the essential manifold.
pub fn refine_essential(inliers: &[Correspondence]) -> Option<EssentialMatrix> {
    if inliers.len() < 8 {
        return None;
    }

    // accumulate A^T A instead of keeping the N x 9 constraint matrix
    let mut normal = SMatrix::<f64, 9, 9>::zeros();
    for c in inliers {
        let (x1, x2) = (c.reference, c.query);
        let row = SMatrix::<f64, 1, 9>::from_row_slice(&[
            x2.x * x1.x,
            x2.x * x1.y,
            x2.x,
            x2.y * x1.x,
            x2.y * x1.y,
            x2.y,
            x1.x,
            x1.y,
            1.0,
        ]);
        normal += row.transpose() * row;
    }

    // the null space is the bottom row of V_t
    let matrix_v_t = normal.svd(false, true).v_t?;
    let essential = Matrix3::from_row_iterator(matrix_v_t.row(8).iter().copied());

    // two equal singular values and a zero
    let svd = essential.svd(true, true);
    let projected = svd.u? * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * svd.v_t?;
    Some(EssentialMatrix(projected / 2f64.sqrt()))
}
