//! Discrete differential operators on triangle meshes.
//!
//! The cotangent Laplacian is the smoothness term of the non-rigid solve and
//! depends on the current vertex positions, so it is recomputed every
//! iteration. The boundary loop is a pure function of the face topology and
//! is computed once per registration run.

use hashbrown::{HashMap, HashSet};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use tracing::{debug, warn};

use crate::error::{RegistrationError, RegistrationResult};
use crate::types::Mesh;

/// Cotangent-weighted discrete Laplacian of a triangle mesh.
///
/// Off-diagonal entries are L(i,j) = −0.5·(cot α + cot β) for the two angles
/// opposite the edge (i,j); diagonals make each row sum to zero (discrete
/// Laplace–Beltrami, negative semi-definite convention). Triangles with a
/// near-degenerate angle contribute nothing for that angle.
pub fn cotangent_laplacian(mesh: &Mesh) -> CsrMatrix<f64> {
    let n = mesh.vertex_count();
    let mut coo = CooMatrix::new(n, n);
    let mut degenerate_angles = 0usize;

    for &[i0, i1, i2] in &mesh.faces {
        let idx = [i0 as usize, i1 as usize, i2 as usize];
        let pos = [
            mesh.vertices[idx[0]].position,
            mesh.vertices[idx[1]].position,
            mesh.vertices[idx[2]].position,
        ];

        for corner in 0..3 {
            // Angle at `corner`, opposite the edge (i, j)
            let i = idx[(corner + 1) % 3];
            let j = idx[(corner + 2) % 3];
            let u = pos[(corner + 1) % 3] - pos[corner];
            let v = pos[(corner + 2) % 3] - pos[corner];

            let cross = u.cross(&v).norm();
            if cross <= 1e-12 {
                degenerate_angles += 1;
                continue;
            }
            let w = 0.5 * u.dot(&v) / cross;

            coo.push(i, j, -w);
            coo.push(j, i, -w);
            coo.push(i, i, w);
            coo.push(j, j, w);
        }
    }

    if degenerate_angles > 0 {
        warn!(
            target: "face_registration::laplacian",
            degenerate_angles,
            "skipped cotangent contributions of near-degenerate angles"
        );
    }

    // Duplicate triplets are summed on conversion
    CsrMatrix::from(&coo)
}

/// Barycentric lumped vertex masses: one third of the incident triangle
/// areas. The masses sum to the mesh's surface area.
pub fn vertex_masses(mesh: &Mesh) -> Vec<f64> {
    let mut masses = vec![0.0; mesh.vertex_count()];
    for (face, tri) in mesh.faces.iter().zip(mesh.triangles()) {
        let share = tri.area() / 3.0;
        for &v in face {
            masses[v as usize] += share;
        }
    }
    masses
}

/// Edges that belong to exactly one face, keyed by sorted endpoints.
fn boundary_edges(mesh: &Mesh) -> Vec<(u32, u32)> {
    let mut edge_count: HashMap<(u32, u32), u32> = HashMap::new();
    for &[a, b, c] in &mesh.faces {
        for (u, v) in [(a, b), (b, c), (c, a)] {
            let key = if u < v { (u, v) } else { (v, u) };
            *edge_count.entry(key).or_insert(0) += 1;
        }
    }
    edge_count
        .into_iter()
        .filter_map(|(edge, count)| (count == 1).then_some(edge))
        .collect()
}

/// The ordered vertex loop of the mesh's single open boundary.
///
/// Registration assumes the template is an open disk. A closed mesh, a mesh
/// with several boundary loops, or a boundary walk that does not close is an
/// [`RegistrationError::InvalidTopology`] error rather than a silently
/// truncated result.
pub fn boundary_loop(mesh: &Mesh) -> RegistrationResult<Vec<u32>> {
    let edges = boundary_edges(mesh);
    if edges.is_empty() {
        return Err(RegistrationError::InvalidTopology {
            details: "mesh is closed; registration requires a single open boundary loop"
                .to_string(),
        });
    }

    // Adjacency restricted to boundary edges
    let mut neighbors: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(a, b) in &edges {
        neighbors.entry(a).or_default().push(b);
        neighbors.entry(b).or_default().push(a);
    }

    let mut visited: HashSet<u32> = HashSet::new();
    let mut loops: Vec<Vec<u32>> = Vec::new();

    for &(start, _) in &edges {
        if visited.contains(&start) {
            continue;
        }

        let mut loop_vertices = Vec::new();
        let mut current = start;
        let mut prev: Option<u32> = None;

        loop {
            visited.insert(current);
            loop_vertices.push(current);

            let candidates = neighbors
                .get(&current)
                .map(|v| v.as_slice())
                .unwrap_or(&[]);

            let next = candidates
                .iter()
                .find(|&&n| Some(n) != prev && !visited.contains(&n))
                .or_else(|| {
                    candidates
                        .iter()
                        .find(|&&n| n == start && loop_vertices.len() > 2)
                });

            match next {
                Some(&n) if n == start => break,
                Some(&n) => {
                    prev = Some(current);
                    current = n;
                }
                None => {
                    return Err(RegistrationError::InvalidTopology {
                        details: format!(
                            "boundary walk starting at vertex {start} did not close \
                             (non-manifold boundary?)"
                        ),
                    });
                }
            }
        }

        loops.push(loop_vertices);
    }

    if loops.len() != 1 {
        return Err(RegistrationError::InvalidTopology {
            details: format!(
                "expected a single boundary loop, found {} (sizes: {:?})",
                loops.len(),
                loops.iter().map(Vec::len).collect::<Vec<_>>()
            ),
        });
    }

    let result = loops.pop().unwrap_or_default();
    debug!(
        target: "face_registration::laplacian",
        boundary_vertices = result.len(),
        "extracted boundary loop"
    );
    Ok(result)
}

/// Per-vertex boundary membership, from a boundary loop.
///
/// Kept separate from the per-iteration proximity filter so both predicates
/// stay individually testable.
#[must_use]
pub fn boundary_mask(vertex_count: usize, boundary: &[u32]) -> Vec<bool> {
    let mut mask = vec![false; vertex_count];
    for &v in boundary {
        mask[v as usize] = true;
    }
    mask
}
