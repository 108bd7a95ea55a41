//! Error types for registration operations.
//!
//! Every failure mode of the registration pipeline maps onto one of four
//! families:
//!
//! - **Input shape**: mismatched or insufficient landmark sets, faces that
//!   reference vertices outside the mesh, empty meshes.
//! - **Topology**: the template does not have exactly one open boundary loop.
//! - **Solver divergence**: the sparse least-squares solve failed to factor
//!   or to converge; the offending non-rigid iteration is reported.
//! - **Degenerate constraints**: an iteration assembled zero constraint rows,
//!   leaving the smoothing system without anchors.
//!
//! Landmark persistence adds the usual file read/write/parse errors.
//!
//! All of these abort the current `register` call; there is no automatic
//! retry. Tuning lambda/epsilon is the caller's decision.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for registration operations.
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Errors that can occur during face registration.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistrationError {
    /// Error reading a landmark file.
    #[error("failed to read landmarks from {path}")]
    #[diagnostic(
        code(face_reg::io::read),
        help("Check that the file exists and is readable")
    )]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error writing a landmark file.
    #[error("failed to write landmarks to {path}")]
    #[diagnostic(
        code(face_reg::io::write),
        help("Check that the directory exists and is writable")
    )]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing a landmark file.
    #[error("failed to parse landmark file {path} at line {line}: {details}")]
    #[diagnostic(
        code(face_reg::parse::landmarks),
        help("Each line must be `face_index w0 w1 w2`, whitespace-separated")
    )]
    ParseError {
        path: PathBuf,
        line: usize,
        details: String,
    },

    /// Empty mesh (no vertices or faces).
    #[error("mesh is empty: {details}")]
    #[diagnostic(
        code(face_reg::input::empty_mesh),
        help("Both template and scan need at least one vertex and one face")
    )]
    EmptyMesh { details: String },

    /// A face references a vertex index outside the mesh.
    #[error(
        "invalid vertex index: face {face_index} references vertex {vertex_index}, \
         but mesh only has {vertex_count} vertices"
    )]
    #[diagnostic(
        code(face_reg::input::vertex_index),
        help("The face array is inconsistent with the vertex array; check the mesh source")
    )]
    InvalidVertexIndex {
        face_index: usize,
        vertex_index: u32,
        vertex_count: usize,
    },

    /// A landmark references a face index outside the mesh.
    #[error(
        "landmark {index} references face {face_index}, but mesh only has {face_count} faces"
    )]
    #[diagnostic(
        code(face_reg::input::landmark_face),
        help("Landmarks must be re-selected after the mesh topology changes")
    )]
    LandmarkOutOfBounds {
        index: usize,
        face_index: u32,
        face_count: usize,
    },

    /// Template and scan landmark sets have different lengths.
    #[error(
        "landmark sets must correspond positionally: template has {template}, scan has {scan}"
    )]
    #[diagnostic(
        code(face_reg::input::landmark_count),
        help("Landmark i on the template corresponds to landmark i on the scan; \
              both files must list the same features in the same order")
    )]
    LandmarkCountMismatch { template: usize, scan: usize },

    /// Too few landmarks for the requested operation.
    #[error("at least {required} landmarks required, got {provided}")]
    #[diagnostic(
        code(face_reg::input::landmark_minimum),
        help("Rigid alignment needs 3 non-collinear correspondences")
    )]
    InsufficientLandmarks { required: usize, provided: usize },

    /// Singular value decomposition failed.
    #[error("SVD of the landmark cross-covariance failed")]
    #[diagnostic(
        code(face_reg::rigid::svd),
        help("The landmark configuration is degenerate (e.g. all collinear)")
    )]
    SvdFailed,

    /// Invalid mesh topology for registration.
    #[error("invalid mesh topology: {details}")]
    #[diagnostic(
        code(face_reg::topology::boundary),
        help("The template must be an open disk with exactly one boundary loop")
    )]
    InvalidTopology { details: String },

    /// An iteration produced no constraint rows at all.
    #[error("no usable constraints: {details}")]
    #[diagnostic(
        code(face_reg::constraints::degenerate),
        help("Enable landmarks, or raise epsilon so closest-point matches pass the threshold")
    )]
    DegenerateConstraints { details: String },

    /// The sparse least-squares solve failed.
    #[error("non-rigid solve failed at iteration {iteration}: {details}")]
    #[diagnostic(
        code(face_reg::solver::divergence),
        help("The stacked system is rank-deficient or badly conditioned; \
              check that boundary or landmark constraints are present")
    )]
    SolverDivergence { iteration: usize, details: String },

    /// A parameter or call sequence was invalid.
    #[error("invalid parameter: {0}")]
    #[diagnostic(code(face_reg::input::parameter))]
    InvalidParameter(String),
}
