//! Non-rigid registration of a face template mesh onto scanned faces.
//!
//! This crate deforms a template mesh until it matches a scanned face,
//! driven by sparse landmark correspondences and iterative closest-point
//! constraints, regularized by a cotangent-weighted discrete Laplacian.
//!
//! # Pipeline
//!
//! A registration run walks a fixed sequence:
//!
//! 1. **Rescale** — both meshes are centered on their landmark centroids and
//!    the template is scaled so its mean landmark-to-centroid distance
//!    matches the scan's.
//! 2. **Rigid alignment** — the optimal landmark rotation (orthogonal
//!    Procrustes) rotates the *scan* into the template's frame.
//! 3. **Index** — a k-d tree is built over the rotated scan's vertices.
//! 4. **Non-rigid iterations** — each step solves a sparse least-squares
//!    system combining Laplacian smoothness with boundary pins, landmark
//!    rows and distance-thresholded closest-point constraints. The first
//!    step uses a tight proximity threshold, later steps a looser one.
//!
//! # Quick Start
//!
//! ```
//! use face_registration::{register, Landmark, LandmarkSet, Mesh, RegistrationParams};
//!
//! // A 2x2 open grid as the template...
//! let template = Mesh::from_arrays(
//!     &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]],
//!     &[[0, 1, 2], [1, 3, 2]],
//! );
//! // ...and the same surface, scaled and translated, as the "scan".
//! let scan = Mesh::from_arrays(
//!     &[[1.0, 0.0, 0.0], [3.0, 0.0, 0.0], [1.0, 2.0, 0.0], [3.0, 2.0, 0.0]],
//!     &[[0, 1, 2], [1, 3, 2]],
//! );
//!
//! // Corner landmarks, selected in the same order on both meshes.
//! let landmarks = LandmarkSet::from_landmarks(vec![
//!     Landmark::at_corner(0, 0),
//!     Landmark::at_corner(0, 1),
//!     Landmark::at_corner(0, 2),
//!     Landmark::at_corner(1, 1),
//! ]);
//!
//! let outcome = register(
//!     template,
//!     scan,
//!     &landmarks,
//!     &landmarks,
//!     &RegistrationParams::default(),
//! )
//! .unwrap();
//!
//! assert!(outcome.landmark_error < 1e-3);
//! ```
//!
//! # Landmarks
//!
//! A [`Landmark`] is intrinsic to the surface: a face index plus barycentric
//! weights. It survives vertex edits and resolves to a cartesian position
//! against any vertex configuration of the same topology. Sets correspond
//! positionally — landmark i on the template matches landmark i on the
//! scan — and persist as whitespace-separated text
//! (`face_index w0 w1 w2`, one record per line).
//!
//! # Requirements on the template
//!
//! The template must be an open disk: exactly one boundary loop. The
//! boundary is pinned during smoothing so the mesh rim does not drift; a
//! closed mesh or one with several boundary loops is rejected up front with
//! a topology error.
//!
//! # Error Handling
//!
//! Operations return [`RegistrationResult<T>`]. Solver failures carry the
//! offending iteration number; all errors abort the current run — lambda and
//! epsilon tuning is left to the caller.
//!
//! # Logging
//!
//! The crate emits `tracing` events (targets under `face_registration::`).
//! Install a subscriber and set `RUST_LOG=face_registration=debug` to see
//! per-iteration constraint counts and timings.

mod error;
mod types;

pub mod constraints;
pub mod landmark;
pub mod laplacian;
pub mod pipeline;
pub mod rigid;
pub mod solver;
pub mod spatial;
pub mod tracing_ext;

pub use error::{RegistrationError, RegistrationResult};
pub use types::{Mesh, Triangle, Vertex};

pub use constraints::{assemble_constraints, within_threshold, ConstraintBlock};
pub use landmark::{Landmark, LandmarkSet};
pub use laplacian::{boundary_loop, boundary_mask, cotangent_laplacian, vertex_masses};
pub use pipeline::{
    register, PipelineStage, RegistrationOutcome, RegistrationParams, RegistrationPipeline,
};
pub use rigid::{
    apply_rotation, center_and_rescale, compute_rotation, landmark_spread, rescale_factor,
};
pub use solver::{solve_nonrigid, SolveStrategy};
pub use spatial::SpatialIndex;
pub use tracing_ext::{log_mesh_stats, OperationTimer};

// Convenience methods on Mesh
impl Mesh {
    /// Register this mesh (as the template) onto a scan.
    ///
    /// Clones both meshes; use [`register`] directly to hand over ownership
    /// instead.
    pub fn registered_to(
        &self,
        scan: &Mesh,
        template_landmarks: &LandmarkSet,
        scan_landmarks: &LandmarkSet,
        params: &RegistrationParams,
    ) -> RegistrationResult<RegistrationOutcome> {
        register(
            self.clone(),
            scan.clone(),
            template_landmarks,
            scan_landmarks,
            params,
        )
    }
}
