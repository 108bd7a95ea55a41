//! Per-iteration constraint assembly for the non-rigid solve.
//!
//! Each non-rigid iteration stacks three kinds of soft constraints into one
//! sparse block and a matching right-hand side:
//!
//! - **Boundary pins**: every boundary vertex is held at its current
//!   position, so the open mesh rim does not drift under smoothing.
//! - **Landmark rows**: barycentric interpolation of the three vertices of a
//!   landmark's face, targeting the corresponding scan landmark.
//! - **Closest-point rows**: a free (non-boundary) vertex is pulled toward
//!   its nearest scan point, but only when the current guess is already
//!   within the proximity threshold. Boundary vertices are excluded here
//!   since they are pinned separately.
//!
//! The block is unweighted; the solver applies the constraint weight λ when
//! it stacks the block under the Laplacian. The block is transient and
//! rebuilt from the current vertex positions every iteration.

use nalgebra::{DMatrix, Point3};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{RegistrationError, RegistrationResult};
use crate::landmark::LandmarkSet;
use crate::spatial::SpatialIndex;
use crate::types::Mesh;

/// Stacked constraint rows for one non-rigid iteration.
#[derive(Debug)]
pub struct ConstraintBlock {
    /// Constraint coefficients, rows × vertex_count.
    pub matrix: CsrMatrix<f64>,
    /// Target positions, rows × 3.
    pub rhs: DMatrix<f64>,
    /// Number of boundary pin rows.
    pub boundary_rows: usize,
    /// Number of landmark rows.
    pub landmark_rows: usize,
    /// Number of closest-point rows.
    pub closest_point_rows: usize,
}

impl ConstraintBlock {
    /// Total number of constraint rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.matrix.nrows()
    }
}

/// Proximity predicate for closest-point constraints.
///
/// Takes the squared distance straight from the spatial index so callers do
/// not pay for a square root per vertex.
#[inline]
#[must_use]
pub fn within_threshold(squared_distance: f64, epsilon: f64) -> bool {
    squared_distance < epsilon * epsilon
}

/// Assemble the constraint block for one iteration.
///
/// `is_boundary` is the per-vertex mask from
/// [`crate::laplacian::boundary_mask`]; `landmarks` carries the template's
/// landmark set together with the already-resolved target positions on the
/// scan; `scan_points` must be the point set the `index` was built over.
///
/// Nearest-neighbor queries run in parallel; each vertex writes its own
/// result slot, so no locking is involved.
pub fn assemble_constraints(
    mesh: &Mesh,
    is_boundary: &[bool],
    landmarks: Option<(&LandmarkSet, &[Point3<f64>])>,
    index: &SpatialIndex,
    scan_points: &[Point3<f64>],
    epsilon: f64,
) -> RegistrationResult<ConstraintBlock> {
    let n = mesh.vertex_count();
    if is_boundary.len() != n {
        return Err(RegistrationError::InvalidParameter(format!(
            "boundary mask has {} entries for {} vertices",
            is_boundary.len(),
            n
        )));
    }

    if let Some((set, targets)) = landmarks {
        if set.len() != targets.len() {
            return Err(RegistrationError::LandmarkCountMismatch {
                template: set.len(),
                scan: targets.len(),
            });
        }
        set.validate_against(mesh)?;
    }

    // Closest-point candidates, one independent query per free vertex.
    let correspondences: Vec<Option<(usize, Point3<f64>)>> = mesh
        .vertices
        .par_iter()
        .enumerate()
        .map(|(v, vertex)| {
            if is_boundary[v] {
                return None;
            }
            let (nearest, squared_distance) = index.nearest_neighbor(&vertex.position);
            within_threshold(squared_distance, epsilon).then(|| (v, scan_points[nearest]))
        })
        .collect();

    let boundary_rows = is_boundary.iter().filter(|&&b| b).count();
    let landmark_rows = landmarks.map_or(0, |(set, _)| set.len());
    let closest_point_rows = correspondences.iter().flatten().count();
    let total_rows = boundary_rows + landmark_rows + closest_point_rows;

    if total_rows == 0 {
        return Err(RegistrationError::DegenerateConstraints {
            details: format!(
                "no boundary, landmark, or closest-point rows (epsilon = {epsilon})"
            ),
        });
    }

    let mut coo = CooMatrix::new(total_rows, n);
    let mut rhs = DMatrix::zeros(total_rows, 3);
    let mut row = 0;

    // Boundary pins hold the current position
    for (v, vertex) in mesh.vertices.iter().enumerate() {
        if is_boundary[v] {
            coo.push(row, v, 1.0);
            rhs[(row, 0)] = vertex.position.x;
            rhs[(row, 1)] = vertex.position.y;
            rhs[(row, 2)] = vertex.position.z;
            row += 1;
        }
    }

    // Landmark rows: barycentric combination of the face's vertices
    if let Some((set, targets)) = landmarks {
        for (landmark, target) in set.iter().zip(targets) {
            let face = mesh.faces[landmark.face_index as usize];
            for (corner, &v) in face.iter().enumerate() {
                coo.push(row, v as usize, landmark.bary[corner]);
            }
            rhs[(row, 0)] = target.x;
            rhs[(row, 1)] = target.y;
            rhs[(row, 2)] = target.z;
            row += 1;
        }
    }

    // Closest-point rows pull free vertices toward the scan surface
    for &(v, target) in correspondences.iter().flatten() {
        coo.push(row, v, 1.0);
        rhs[(row, 0)] = target.x;
        rhs[(row, 1)] = target.y;
        rhs[(row, 2)] = target.z;
        row += 1;
    }

    debug!(
        target: "face_registration::constraints",
        boundary_rows,
        landmark_rows,
        closest_point_rows,
        epsilon,
        "assembled constraint block"
    );

    Ok(ConstraintBlock {
        matrix: CsrMatrix::from(&coo),
        rhs,
        boundary_rows,
        landmark_rows,
        closest_point_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmark::Landmark;
    use crate::laplacian::{boundary_loop, boundary_mask};
    use crate::types::Vertex;

    /// Open planar grid of `rows` x `cols` vertices in the XY plane.
    fn grid_mesh(rows: usize, cols: usize) -> Mesh {
        let mut mesh = Mesh::with_capacity(rows * cols, 2 * (rows - 1) * (cols - 1));
        for r in 0..rows {
            for c in 0..cols {
                mesh.vertices
                    .push(Vertex::from_coords(c as f64, r as f64, 0.0));
            }
        }
        let at = |r: usize, c: usize| (r * cols + c) as u32;
        for r in 0..rows - 1 {
            for c in 0..cols - 1 {
                mesh.faces.push([at(r, c), at(r, c + 1), at(r + 1, c)]);
                mesh.faces
                    .push([at(r, c + 1), at(r + 1, c + 1), at(r + 1, c)]);
            }
        }
        mesh
    }

    fn grid_fixture() -> (Mesh, Vec<bool>, Vec<Point3<f64>>, SpatialIndex) {
        let mesh = grid_mesh(4, 4);
        let boundary = boundary_loop(&mesh).unwrap();
        let mask = boundary_mask(mesh.vertex_count(), &boundary);
        let scan_points = mesh.points();
        let index = SpatialIndex::build(&scan_points);
        (mesh, mask, scan_points, index)
    }

    #[test]
    fn test_row_counts_with_coincident_scan() {
        let (mesh, mask, scan_points, index) = grid_fixture();
        let interior = mask.iter().filter(|&&b| !b).count();

        let block =
            assemble_constraints(&mesh, &mask, None, &index, &scan_points, 0.5).unwrap();

        assert_eq!(block.boundary_rows, 12); // 4x4 grid perimeter
        assert_eq!(block.landmark_rows, 0);
        assert_eq!(block.closest_point_rows, interior);
        assert_eq!(block.row_count(), 12 + interior);
        assert_eq!(block.rhs.nrows(), block.row_count());
    }

    #[test]
    fn test_boundary_vertices_not_double_constrained() {
        let (mesh, mask, scan_points, index) = grid_fixture();

        let block =
            assemble_constraints(&mesh, &mask, None, &index, &scan_points, 100.0).unwrap();

        // Even with a huge epsilon, boundary vertices appear only as pins.
        let interior = mask.iter().filter(|&&b| !b).count();
        assert_eq!(block.closest_point_rows, interior);
    }

    #[test]
    fn test_landmark_rows_use_barycentric_weights() {
        let (mesh, mask, scan_points, index) = grid_fixture();
        let set = LandmarkSet::from_landmarks(vec![Landmark::new(0, [0.25, 0.5, 0.25])]);
        let targets = vec![Point3::new(1.0, 2.0, 3.0)];

        let block = assemble_constraints(
            &mesh,
            &mask,
            Some((&set, &targets)),
            &index,
            &scan_points,
            0.0,
        )
        .unwrap();

        assert_eq!(block.landmark_rows, 1);

        // The landmark row is the one after the boundary pins; its entries
        // must be the barycentric weights on the face's vertices.
        let row = block.boundary_rows;
        let weights: f64 = block
            .matrix
            .triplet_iter()
            .filter(|(r, _, _)| *r == row)
            .map(|(_, _, v)| v)
            .sum();
        assert!((weights - 1.0).abs() < 1e-12);
        assert_eq!(block.rhs[(row, 2)], 3.0);
    }

    #[test]
    fn test_zero_closest_point_rows_is_fine() {
        let (mesh, mask, _, _) = grid_fixture();
        // Scan far away: nothing passes a tight threshold.
        let far: Vec<Point3<f64>> = mesh
            .points()
            .iter()
            .map(|p| Point3::new(p.x + 100.0, p.y, p.z))
            .collect();
        let index = SpatialIndex::build(&far);

        let block = assemble_constraints(&mesh, &mask, None, &index, &far, 0.01).unwrap();
        assert_eq!(block.closest_point_rows, 0);
        assert_eq!(block.row_count(), block.boundary_rows);
    }

    #[test]
    fn test_all_sources_empty_is_degenerate() {
        let (mesh, _, _, _) = grid_fixture();
        let far: Vec<Point3<f64>> = mesh
            .points()
            .iter()
            .map(|p| Point3::new(p.x + 100.0, p.y, p.z))
            .collect();
        let index = SpatialIndex::build(&far);
        let no_boundary = vec![false; mesh.vertex_count()];

        let result = assemble_constraints(&mesh, &no_boundary, None, &index, &far, 0.01);
        assert!(matches!(
            result,
            Err(RegistrationError::DegenerateConstraints { .. })
        ));
    }

    #[test]
    fn test_mismatched_landmark_targets() {
        let (mesh, mask, scan_points, index) = grid_fixture();
        let set = LandmarkSet::from_landmarks(vec![
            Landmark::at_corner(0, 0),
            Landmark::at_corner(1, 0),
        ]);
        let targets = vec![Point3::origin()];

        let result = assemble_constraints(
            &mesh,
            &mask,
            Some((&set, &targets)),
            &index,
            &scan_points,
            0.5,
        );
        assert!(matches!(
            result,
            Err(RegistrationError::LandmarkCountMismatch { .. })
        ));
    }
}
