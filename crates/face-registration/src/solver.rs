//! Sparse least-squares solve for one non-rigid iteration.
//!
//! The stacked system is
//!
//! ```text
//! A = [ L      ]        b = [ L · V_current ]
//!     [ λ · C  ]            [ λ · targets   ]
//! ```
//!
//! with L the cotangent Laplacian (smoothness) and C the constraint block of
//! the current iteration. A has more rows than columns; the solve minimizes
//! ‖A·X − b‖² independently for the x, y and z columns.
//!
//! Two strategies are supported. Normal equations with a sparse Cholesky
//! factorization are the default: AᵀA is positive definite as long as the
//! constraint rows anchor the Laplacian's constant null space, which the
//! assembler guarantees by rejecting empty blocks. CGLS iterates on A
//! directly without forming AᵀA and trades speed for robustness on
//! ill-conditioned systems. Both must agree up to solver tolerance.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix, CsrMatrix};
use tracing::{debug, trace};

use crate::constraints::ConstraintBlock;
use crate::error::{RegistrationError, RegistrationResult};

/// How the stacked least-squares system is solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolveStrategy {
    /// Solve AᵀA·X = Aᵀb with a sparse Cholesky factorization.
    #[default]
    NormalCholesky,
    /// CGLS (conjugate gradient on the least-squares problem) directly on A.
    ConjugateGradient,
}

/// Relative tolerance on ‖Aᵀr‖ for CGLS termination.
const CGLS_TOLERANCE: f64 = 1e-12;

/// Solve one non-rigid step for new vertex positions.
///
/// `laplacian` must be the N×N cotangent Laplacian of the current mesh,
/// `positions` the current N×3 vertex positions, and `block` the constraint
/// system assembled for this iteration. `iteration` is only used to label
/// solver failures.
pub fn solve_nonrigid(
    laplacian: &CsrMatrix<f64>,
    positions: &DMatrix<f64>,
    block: &ConstraintBlock,
    lambda: f64,
    strategy: SolveStrategy,
    iteration: usize,
) -> RegistrationResult<DMatrix<f64>> {
    let n = laplacian.nrows();
    if laplacian.ncols() != n || positions.nrows() != n || positions.ncols() != 3 {
        return Err(RegistrationError::InvalidParameter(format!(
            "laplacian is {}x{}, positions {}x{}; expected N x N and N x 3",
            laplacian.nrows(),
            laplacian.ncols(),
            positions.nrows(),
            positions.ncols()
        )));
    }
    if !(lambda > 0.0) {
        return Err(RegistrationError::InvalidParameter(format!(
            "lambda must be positive, got {lambda}"
        )));
    }

    let m = block.row_count();

    // Stack A = [L; lambda * C]
    let mut coo = CooMatrix::new(n + m, n);
    for (i, j, v) in laplacian.triplet_iter() {
        coo.push(i, j, *v);
    }
    for (i, j, v) in block.matrix.triplet_iter() {
        coo.push(n + i, j, lambda * v);
    }
    let a = CsrMatrix::from(&coo);

    // Stack b = [L * V; lambda * targets]
    let smooth_rhs: DMatrix<f64> = laplacian * positions;
    let mut b = DMatrix::zeros(n + m, 3);
    b.view_mut((0, 0), (n, 3)).copy_from(&smooth_rhs);
    b.view_mut((n, 0), (m, 3)).copy_from(&(lambda * &block.rhs));

    match strategy {
        SolveStrategy::NormalCholesky => solve_normal_equations(&a, &b, iteration),
        SolveStrategy::ConjugateGradient => solve_cgls(&a, &b, iteration),
    }
}

/// Normal equations: AᵀA·X = Aᵀb via sparse Cholesky.
fn solve_normal_equations(
    a: &CsrMatrix<f64>,
    b: &DMatrix<f64>,
    iteration: usize,
) -> RegistrationResult<DMatrix<f64>> {
    let at = a.transpose();
    let ata = &at * a;
    let atb = &at * b;

    let csc = CscMatrix::from(&ata);
    let factorization =
        CscCholesky::factor(&csc).map_err(|e| RegistrationError::SolverDivergence {
            iteration,
            details: format!(
                "sparse Cholesky factorization failed ({e:?}); \
                 the system is rank-deficient"
            ),
        })?;

    debug!(
        target: "face_registration::solver",
        rows = a.nrows(),
        cols = a.ncols(),
        nnz = a.nnz(),
        "solved normal equations"
    );
    Ok(factorization.solve(&atb))
}

/// CGLS on the stacked system, one column at a time.
fn solve_cgls(
    a: &CsrMatrix<f64>,
    b: &DMatrix<f64>,
    iteration: usize,
) -> RegistrationResult<DMatrix<f64>> {
    let n = a.ncols();
    let at = a.transpose();
    let max_iterations = (10 * n).max(1000);

    let mut x = DMatrix::zeros(n, 3);
    for col in 0..3 {
        let b_col = b.column(col).into_owned();
        let (solution, used) = cgls(a, &at, &b_col, max_iterations).map_err(|details| {
            RegistrationError::SolverDivergence { iteration, details }
        })?;
        trace!(
            target: "face_registration::solver",
            column = col,
            cg_iterations = used,
            "CGLS column converged"
        );
        x.set_column(col, &solution);
    }
    Ok(x)
}

/// Textbook CGLS recurrence: minimizes ‖A·x − b‖² without forming AᵀA.
fn cgls(
    a: &CsrMatrix<f64>,
    at: &CsrMatrix<f64>,
    b: &DVector<f64>,
    max_iterations: usize,
) -> Result<(DVector<f64>, usize), String> {
    let n = a.ncols();
    let mut x = DVector::zeros(n);
    let mut r = b.clone();
    let mut s: DVector<f64> = at * &r;

    let threshold = CGLS_TOLERANCE * s.norm().max(1.0);
    if s.norm() <= threshold {
        return Ok((x, 0));
    }

    let mut p = s.clone();
    let mut gamma = s.norm_squared();

    for k in 0..max_iterations {
        let q: DVector<f64> = a * &p;
        let q_norm_squared = q.norm_squared();
        if q_norm_squared <= f64::MIN_POSITIVE {
            return Err("CGLS search direction annihilated by A".to_string());
        }

        let alpha = gamma / q_norm_squared;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &q, 1.0);

        s = at * &r;
        let gamma_next = s.norm_squared();
        if gamma_next.sqrt() <= threshold {
            return Ok((x, k + 1));
        }

        let beta = gamma_next / gamma;
        gamma = gamma_next;
        p *= beta;
        p += &s;
    }

    Err(format!(
        "CGLS did not converge within {max_iterations} iterations"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::assemble_constraints;
    use crate::laplacian::{boundary_loop, boundary_mask, cotangent_laplacian};
    use crate::spatial::SpatialIndex;
    use crate::types::{Mesh, Vertex};
    use nalgebra::Point3;

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

    fn solve_one_step(
        mesh: &Mesh,
        scan_points: &[Point3<f64>],
        epsilon: f64,
        lambda: f64,
        strategy: SolveStrategy,
    ) -> DMatrix<f64> {
        let boundary = boundary_loop(mesh).unwrap();
        let mask = boundary_mask(mesh.vertex_count(), &boundary);
        let index = SpatialIndex::build(scan_points);
        let block =
            assemble_constraints(mesh, &mask, None, &index, scan_points, epsilon).unwrap();
        let l = cotangent_laplacian(mesh);
        let positions = mesh.positions();
        solve_nonrigid(&l, &positions, &block, lambda, strategy, 0).unwrap()
    }

    #[test]
    fn test_coincident_scan_is_a_fixed_point() {
        let mesh = grid_mesh(5, 5);
        let scan_points = mesh.points();

        let solved = solve_one_step(&mesh, &scan_points, 0.5, 1.0, SolveStrategy::NormalCholesky);
        let positions = mesh.positions();
        let diff = (&solved - &positions).abs().max();
        assert!(diff < 1e-8, "max deviation {diff}");
    }

    #[test]
    fn test_boundary_pins_hold_with_large_lambda() {
        let mesh = grid_mesh(5, 5);
        // Scan shifted upward: interior vertices get pulled, boundary must not.
        let scan_points: Vec<Point3<f64>> = mesh
            .points()
            .iter()
            .map(|p| Point3::new(p.x, p.y, p.z + 0.4))
            .collect();

        let solved = solve_one_step(&mesh, &scan_points, 10.0, 1e4, SolveStrategy::NormalCholesky);

        let boundary = boundary_loop(&mesh).unwrap();
        for &v in &boundary {
            let v = v as usize;
            let before = mesh.vertices[v].position;
            let dx = (solved[(v, 0)] - before.x).abs();
            let dy = (solved[(v, 1)] - before.y).abs();
            let dz = (solved[(v, 2)] - before.z).abs();
            assert!(
                dx < 1e-4 && dy < 1e-4 && dz < 1e-4,
                "boundary vertex {v} moved by ({dx}, {dy}, {dz})"
            );
        }
    }

    #[test]
    fn test_interior_moves_toward_scan() {
        let mesh = grid_mesh(5, 5);
        let scan_points: Vec<Point3<f64>> = mesh
            .points()
            .iter()
            .map(|p| Point3::new(p.x, p.y, p.z + 0.4))
            .collect();

        let solved = solve_one_step(&mesh, &scan_points, 10.0, 5.0, SolveStrategy::NormalCholesky);

        // Central vertex of the 5x5 grid is index 12; with a strong lambda
        // it must end up close to the shifted scan.
        assert!(solved[(12, 2)] > 0.2, "center z = {}", solved[(12, 2)]);
        assert!(solved[(12, 2)] < 0.45, "center z = {}", solved[(12, 2)]);
    }

    #[test]
    fn test_strategies_agree_on_grid() {
        let mesh = grid_mesh(5, 5);
        let scan_points: Vec<Point3<f64>> = mesh
            .points()
            .iter()
            .map(|p| Point3::new(p.x + 0.1, p.y, p.z + 0.2))
            .collect();

        let cholesky =
            solve_one_step(&mesh, &scan_points, 10.0, 1.0, SolveStrategy::NormalCholesky);
        let cg = solve_one_step(
            &mesh,
            &scan_points,
            10.0,
            1.0,
            SolveStrategy::ConjugateGradient,
        );

        let diff = (&cholesky - &cg).abs().max();
        assert!(diff < 1e-6, "strategies diverge by {diff}");
    }

    #[test]
    fn test_invalid_lambda() {
        let mesh = grid_mesh(3, 3);
        let scan_points = mesh.points();
        let boundary = boundary_loop(&mesh).unwrap();
        let mask = boundary_mask(mesh.vertex_count(), &boundary);
        let index = SpatialIndex::build(&scan_points);
        let block =
            assemble_constraints(&mesh, &mask, None, &index, &scan_points, 0.5).unwrap();
        let l = cotangent_laplacian(&mesh);
        let positions = mesh.positions();

        let result = solve_nonrigid(
            &l,
            &positions,
            &block,
            0.0,
            SolveStrategy::NormalCholesky,
            0,
        );
        assert!(matches!(
            result,
            Err(RegistrationError::InvalidParameter(_))
        ));
    }
}
