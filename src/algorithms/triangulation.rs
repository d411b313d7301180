use nalgebra::{Matrix3, Matrix3x4, Matrix4, RowVector4, Vector2, Vector3};

/// Homogeneous weights below this put the point at infinity.
const MIN_HOMOGENEOUS_WEIGHT: f64 = 1e-12;

/// `3x4` projection `[R | t]` of a calibrated camera.
pub fn projection_matrix(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3x4<f64> {
    let mut projection = Matrix3x4::zeros();
    projection.fixed_columns_mut::<3>(0).copy_from(rotation);
    projection.set_column(3, translation);
    projection
}

/// Linear (DLT) triangulation of normalized image correspondences.
///
/// Points are expressed in the frame the two projections share. A point whose
/// homogeneous weight vanishes (parallel rays) comes back as `None`.
pub fn triangulate_linear(
    camera_matrix1: &Matrix3x4<f64>,
    camera_matrix2: &Matrix3x4<f64>,
    x1_set: &[Vector2<f64>],
    x2_set: &[Vector2<f64>],
) -> Vec<Option<Vector3<f64>>> {
    x1_set
        .iter()
        .zip(x2_set)
        .map(|(x1, x2)| {
            let matrix_a = Matrix4::from_rows(&[
                dlt_row(camera_matrix1, x1.y, 1),
                dlt_row(camera_matrix1, x1.x, 0),
                dlt_row(camera_matrix2, x2.y, 1),
                dlt_row(camera_matrix2, x2.x, 0),
            ]);

            // V_t obtained from SVD of matrix A
            let matrix_v_t = matrix_a.svd(false, true).v_t?;
            let solution = matrix_v_t.row(3);

            // convert to homogenous coordinates and back into euclidean
            if solution[3].abs() < MIN_HOMOGENEOUS_WEIGHT {
                return None;
            }
            Some(Vector3::new(solution[0], solution[1], solution[2]) / solution[3])
        })
        .collect()
}

/// `coordinate * P_3 - P_row` for the image coordinate on the given row.
fn dlt_row(camera_matrix: &Matrix3x4<f64>, coordinate: f64, row: usize) -> RowVector4<f64> {
    camera_matrix.row(2) * coordinate - camera_matrix.row(row)
}
