//! Tracing helpers for registration operations.
//!
//! Enable output by installing a `tracing` subscriber in the application;
//! set `RUST_LOG=face_registration=debug` for per-iteration detail.

use std::time::Instant;
use tracing::{debug, info};

use crate::types::Mesh;

/// A performance timer that logs its duration on drop.
///
/// ```rust,ignore
/// let _timer = OperationTimer::new("rigid_align");
/// // ... do work ...
/// // duration is logged when the timer goes out of scope
/// ```
pub struct OperationTimer {
    name: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Create a new operation timer.
    pub fn new(name: &'static str) -> Self {
        debug!(target: "face_registration::timing", operation = name, "starting operation");
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        info!(
            target: "face_registration::timing",
            operation = self.name,
            elapsed_ms = format!("{:.2}", self.elapsed_ms()),
            "operation completed"
        );
    }
}

/// Log mesh statistics at debug level.
pub fn log_mesh_stats(mesh: &Mesh, context: &str) {
    let dims = mesh
        .bounds()
        .map(|(min, max)| max - min)
        .unwrap_or_else(nalgebra::Vector3::zeros);

    debug!(
        target: "face_registration::mesh_state",
        context = context,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        dimensions = format!("{:.2} x {:.2} x {:.2}", dims.x, dims.y, dims.z),
        "mesh state"
    );
}
