//! Spatial index for nearest-neighbor queries.
//!
//! Wraps a k-d tree over a fixed point set. The index is rebuilt whenever
//! the underlying points change; it is never mutated in place. Concurrent
//! read-only queries are safe, which the constraint assembler relies on for
//! its parallel per-vertex lookups.

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::Point3;

use crate::types::Mesh;

/// A k-d tree over a 3D point set.
///
/// Construction is O(N log N); a nearest-neighbor query is O(log N)
/// amortized. Querying an empty index is a contract violation: callers must
/// build the index from a non-empty point set before registration begins.
pub struct SpatialIndex {
    tree: KdTree<f64, 3>,
    len: usize,
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex").field("len", &self.len).finish()
    }
}

impl SpatialIndex {
    /// Build an index over the given points.
    ///
    /// Point order is preserved: query results index into `points`.
    pub fn build(points: &[Point3<f64>]) -> Self {
        let mut tree = KdTree::new();
        for (i, point) in points.iter().enumerate() {
            tree.add(&[point.x, point.y, point.z], i as u64);
        }
        Self {
            tree,
            len: points.len(),
        }
    }

    /// Build an index over a mesh's vertex positions.
    pub fn from_mesh(mesh: &Mesh) -> Self {
        Self::build(&mesh.points())
    }

    /// Number of indexed points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the index holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The single closest indexed point to `query` under Euclidean distance.
    ///
    /// Returns the point's index and the squared distance. Deterministic
    /// given identical input.
    pub fn nearest_neighbor(&self, query: &Point3<f64>) -> (usize, f64) {
        debug_assert!(!self.is_empty(), "nearest_neighbor on an empty index");
        let nearest = self
            .tree
            .nearest_one::<SquaredEuclidean>(&[query.x, query.y, query.z]);
        (nearest.item as usize, nearest.distance)
    }
}
