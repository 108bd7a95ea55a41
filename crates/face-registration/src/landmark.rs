//! Landmarks: intrinsic surface points and their persistence.
//!
//! A landmark is a point on a mesh surface expressed as a face index plus
//! barycentric weights, so it survives vertex position edits. Landmark sets
//! are ordered: landmark i on the template corresponds to landmark i on the
//! scan, by selection order. No explicit IDs are stored.
//!
//! The persisted form is one record per line, whitespace-separated:
//!
//! ```text
//! face_index w0 w1 w2
//! ```

use std::fs;
use std::io::Write;
use std::path::Path;

use nalgebra::Point3;
use tracing::warn;

use crate::error::{RegistrationError, RegistrationResult};
use crate::types::Mesh;

/// A point on a mesh surface: a face index plus barycentric weights.
///
/// The weights are expected to be non-negative and sum to 1. This is not
/// enforced on construction; [`LandmarkSet::load`] warns when a record
/// deviates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    /// Index into the mesh's face array.
    pub face_index: u32,
    /// Barycentric weights for the face's three vertices.
    pub bary: [f64; 3],
}

impl Landmark {
    /// Create a new landmark.
    #[must_use]
    pub const fn new(face_index: u32, bary: [f64; 3]) -> Self {
        Self { face_index, bary }
    }

    /// A landmark sitting exactly on the `corner`-th vertex of a face.
    #[must_use]
    pub const fn at_corner(face_index: u32, corner: usize) -> Self {
        let mut bary = [0.0; 3];
        bary[corner] = 1.0;
        Self { face_index, bary }
    }

    /// Resolve the landmark's cartesian position on the given mesh.
    pub fn cartesian(&self, mesh: &Mesh) -> Option<Point3<f64>> {
        mesh.triangle(self.face_index as usize)
            .map(|tri| tri.barycentric_point(self.bary))
    }

    /// Sum of the barycentric weights.
    #[must_use]
    pub fn weight_sum(&self) -> f64 {
        self.bary[0] + self.bary[1] + self.bary[2]
    }
}

/// An ordered sequence of landmarks, one per semantic facial feature.
///
/// Read-only during registration; correspondence with another set is
/// positional.
#[derive(Debug, Clone, Default)]
pub struct LandmarkSet {
    landmarks: Vec<Landmark>,
}

impl LandmarkSet {
    /// Create an empty landmark set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a landmark set from a list of landmarks.
    #[must_use]
    pub fn from_landmarks(landmarks: Vec<Landmark>) -> Self {
        Self { landmarks }
    }

    /// Number of landmarks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    /// Append a landmark (selection order defines correspondence).
    pub fn push(&mut self, landmark: Landmark) {
        self.landmarks.push(landmark);
    }

    /// Iterate over the landmarks in selection order.
    pub fn iter(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.iter()
    }

    /// The underlying slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Landmark] {
        &self.landmarks
    }

    /// Check that every landmark references a face of `mesh`.
    pub fn validate_against(&self, mesh: &Mesh) -> RegistrationResult<()> {
        let face_count = mesh.face_count();
        for (index, landmark) in self.landmarks.iter().enumerate() {
            if landmark.face_index as usize >= face_count {
                return Err(RegistrationError::LandmarkOutOfBounds {
                    index,
                    face_index: landmark.face_index,
                    face_count,
                });
            }
        }
        Ok(())
    }

    /// Resolve every landmark to its cartesian position on `mesh`.
    ///
    /// The result is ordered like the set, so two resolved sets can be
    /// zipped to form correspondences.
    pub fn resolve(&self, mesh: &Mesh) -> RegistrationResult<Vec<Point3<f64>>> {
        self.validate_against(mesh)?;
        Ok(self
            .landmarks
            .iter()
            .map(|l| {
                // validate_against checked the face index
                mesh.triangle(l.face_index as usize)
                    .map(|tri| tri.barycentric_point(l.bary))
                    .unwrap_or_else(Point3::origin)
            })
            .collect())
    }

    /// Write the set to a file in the canonical text format.
    pub fn save(&self, path: impl AsRef<Path>) -> RegistrationResult<()> {
        let path = path.as_ref();
        let mut buffer = Vec::with_capacity(self.landmarks.len() * 48);
        for landmark in &self.landmarks {
            writeln!(
                buffer,
                "{} {} {} {}",
                landmark.face_index, landmark.bary[0], landmark.bary[1], landmark.bary[2]
            )
            .map_err(|source| RegistrationError::IoWrite {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, buffer).map_err(|source| RegistrationError::IoWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a set from a file in the canonical text format.
    ///
    /// Blank lines are ignored. Records whose weights do not sum to 1 are
    /// accepted with a warning.
    pub fn load(path: impl AsRef<Path>) -> RegistrationResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| RegistrationError::IoRead {
            path: path.to_path_buf(),
            source,
        })?;

        let mut landmarks = Vec::new();
        for (line_number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 {
                return Err(RegistrationError::ParseError {
                    path: path.to_path_buf(),
                    line: line_number + 1,
                    details: format!("expected 4 fields, got {}", fields.len()),
                });
            }

            let face_index: u32 = fields[0].parse().map_err(|_| RegistrationError::ParseError {
                path: path.to_path_buf(),
                line: line_number + 1,
                details: format!("invalid face index {:?}", fields[0]),
            })?;

            let mut bary = [0.0; 3];
            for (slot, field) in bary.iter_mut().zip(&fields[1..]) {
                *slot = field.parse().map_err(|_| RegistrationError::ParseError {
                    path: path.to_path_buf(),
                    line: line_number + 1,
                    details: format!("invalid barycentric weight {field:?}"),
                })?;
            }

            let landmark = Landmark::new(face_index, bary);
            if (landmark.weight_sum() - 1.0).abs() > 1e-6 {
                warn!(
                    target: "face_registration::landmarks",
                    line = line_number + 1,
                    sum = landmark.weight_sum(),
                    "barycentric weights do not sum to 1"
                );
            }
            landmarks.push(landmark);
        }

        Ok(Self { landmarks })
    }
}

impl FromIterator<Landmark> for LandmarkSet {
    fn from_iter<I: IntoIterator<Item = Landmark>>(iter: I) -> Self {
        Self {
            landmarks: iter.into_iter().collect(),
        }
    }
}
