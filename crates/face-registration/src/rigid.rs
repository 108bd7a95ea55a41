//! Rigid alignment: orthogonal Procrustes and landmark-based rescaling.
//!
//! The rotation between two corresponding landmark sets is the closed-form
//! optimum from the SVD of their cross-covariance. Uniform scale is the
//! ratio of mean landmark-to-centroid distances. Applying either transform
//! to a full mesh is the caller's (pipeline's) responsibility; the functions
//! here are pure.

use nalgebra::{Matrix3, Point3, Vector3};
use tracing::debug;

use crate::error::{RegistrationError, RegistrationResult};
use crate::types::Mesh;

/// Minimum number of correspondences for a unique rotation.
pub const MIN_LANDMARKS: usize = 3;

/// Centroid of a point set.
#[must_use]
pub fn centroid(points: &[Point3<f64>]) -> Vector3<f64> {
    let n = points.len().max(1) as f64;
    let sum: Vector3<f64> = points.iter().map(|p| p.coords).sum();
    sum / n
}

/// Mean distance of a point set to its own centroid.
///
/// This is the "spread" used for uniform rescaling; it is zero only for
/// degenerate (single-point) landmark configurations.
#[must_use]
pub fn landmark_spread(points: &[Point3<f64>]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let bc = centroid(points);
    points.iter().map(|p| (p.coords - bc).norm()).sum::<f64>() / points.len() as f64
}

/// Uniform scale factor that makes the template's landmark spread match the
/// scan's.
pub fn rescale_factor(
    template_landmarks: &[Point3<f64>],
    scan_landmarks: &[Point3<f64>],
) -> RegistrationResult<f64> {
    let template_spread = landmark_spread(template_landmarks);
    let scan_spread = landmark_spread(scan_landmarks);
    if template_spread <= f64::EPSILON || scan_spread <= f64::EPSILON {
        return Err(RegistrationError::InvalidParameter(
            "landmark spread is zero; cannot compute rescale factor".to_string(),
        ));
    }
    Ok(scan_spread / template_spread)
}

/// Center a mesh on a landmark centroid and scale it uniformly.
///
/// Every vertex becomes `factor * (v - centroid(landmark_points))`, leaving
/// the landmark centroid at the origin.
pub fn center_and_rescale(mesh: &mut Mesh, landmark_points: &[Point3<f64>], factor: f64) {
    let bc = centroid(landmark_points);
    for vertex in &mut mesh.vertices {
        vertex.position = Point3::from(factor * (vertex.position.coords - bc));
    }
}

/// Optimal rotation mapping `source` points onto `target` points.
///
/// Orthogonal Procrustes: both sets are centered on their centroids, the
/// cross-covariance H = Σ sᵢ·tᵢᵀ is decomposed as H = UΣVᵀ, and the rotation
/// is R = V·Uᵀ. A general SVD may yield a reflection (det = −1); the sign of
/// the last singular vector is flipped to force a proper rotation.
///
/// Requires K ≥ 3 correspondences of equal length. The returned matrix
/// satisfies R·(sᵢ − s̄) ≈ tᵢ − t̄ in the least-squares sense.
pub fn compute_rotation(
    source: &[Point3<f64>],
    target: &[Point3<f64>],
) -> RegistrationResult<Matrix3<f64>> {
    if source.len() < MIN_LANDMARKS {
        return Err(RegistrationError::InsufficientLandmarks {
            required: MIN_LANDMARKS,
            provided: source.len(),
        });
    }
    if source.len() != target.len() {
        return Err(RegistrationError::LandmarkCountMismatch {
            template: target.len(),
            scan: source.len(),
        });
    }

    let source_centroid = centroid(source);
    let target_centroid = centroid(target);

    // Cross-covariance of the centered sets
    let mut h = Matrix3::zeros();
    for (s, t) in source.iter().zip(target.iter()) {
        h += (s.coords - source_centroid) * (t.coords - target_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(RegistrationError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(RegistrationError::SvdFailed)?;

    let mut rotation = v_t.transpose() * u.transpose();

    // Reflection case: flip the sign of the last column of V
    if rotation.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation = v * u.transpose();
    }

    debug!(
        target: "face_registration::rigid",
        correspondences = source.len(),
        det = rotation.determinant(),
        "computed Procrustes rotation"
    );

    Ok(rotation)
}

/// Rotate every vertex of a mesh about the origin.
pub fn apply_rotation(mesh: &mut Mesh, rotation: &Matrix3<f64>) {
    for vertex in &mut mesh.vertices {
        vertex.position = Point3::from(rotation * vertex.position.coords);
        if let Some(ref mut normal) = vertex.normal {
            *normal = rotation * *normal;
        }
    }
}
