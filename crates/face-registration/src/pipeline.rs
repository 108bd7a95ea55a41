//! Registration pipeline: rescale, rigid-align, index, iterate.
//!
//! The pipeline owns both meshes for the duration of a run and walks a
//! fixed stage sequence:
//!
//! ```text
//! Unaligned -> Rescaled -> RigidlyAligned -> IndexBuilt
//!           -> NonRigidIterating -> Converged
//! ```
//!
//! Convention: the **scan is rotated into the template's frame** during
//! rigid alignment. All closest-point and landmark targets afterwards live
//! on the rotated scan, so the direction of the rotation is load-bearing
//! and fixed here.
//!
//! `iterate` may be called again on a converged pipeline to keep refining;
//! there is no terminal lock.

use nalgebra::Point3;
use tracing::{debug, info};

use crate::constraints::assemble_constraints;
use crate::error::{RegistrationError, RegistrationResult};
use crate::landmark::LandmarkSet;
use crate::laplacian::{boundary_loop, boundary_mask, cotangent_laplacian};
use crate::rigid;
use crate::solver::{solve_nonrigid, SolveStrategy};
use crate::spatial::SpatialIndex;
use crate::tracing_ext::{log_mesh_stats, OperationTimer};
use crate::types::Mesh;

/// Configuration for a registration run.
///
/// Immutable during the run; supplied fresh on every call. There is no
/// process-wide mutable configuration.
#[derive(Debug, Clone)]
pub struct RegistrationParams {
    /// Number of non-rigid iterations per `iterate` call.
    pub iterations: usize,

    /// Constraint weight λ applied to boundary, landmark and closest-point
    /// rows when they are stacked under the Laplacian.
    pub lambda: f64,

    /// Proximity threshold for the first iteration of a call. Kept tight so
    /// early iterations are not pulled toward far-away wrong matches.
    pub epsilon_initial: f64,

    /// Proximity threshold for the remaining iterations, looser so more of
    /// the surface participates once the meshes are globally close.
    pub epsilon_refine: f64,

    /// Whether to include landmark constraint rows.
    pub use_landmarks: bool,

    /// Least-squares strategy for the per-iteration solve.
    pub strategy: SolveStrategy,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            iterations: 5,
            lambda: 1.0,
            epsilon_initial: 0.01,
            epsilon_refine: 3.0,
            use_landmarks: true,
            strategy: SolveStrategy::default(),
        }
    }
}

impl RegistrationParams {
    /// Create params with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of non-rigid iterations.
    #[must_use]
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the constraint weight.
    #[must_use]
    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    /// Set the two-phase proximity thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, epsilon_initial: f64, epsilon_refine: f64) -> Self {
        self.epsilon_initial = epsilon_initial;
        self.epsilon_refine = epsilon_refine;
        self
    }

    /// Disable landmark constraint rows.
    #[must_use]
    pub fn without_landmarks(mut self) -> Self {
        self.use_landmarks = false;
        self
    }

    /// Set the least-squares strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: SolveStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn validate(&self) -> RegistrationResult<()> {
        if self.iterations == 0 {
            return Err(RegistrationError::InvalidParameter(
                "iterations must be at least 1".to_string(),
            ));
        }
        if !(self.lambda > 0.0) {
            return Err(RegistrationError::InvalidParameter(format!(
                "lambda must be positive, got {}",
                self.lambda
            )));
        }
        if self.epsilon_initial < 0.0 || self.epsilon_refine < 0.0 {
            return Err(RegistrationError::InvalidParameter(
                "proximity thresholds must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a pipeline currently is in the stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Unaligned,
    Rescaled,
    RigidlyAligned,
    IndexBuilt,
    NonRigidIterating,
    Converged,
}

/// Result of a full registration run.
#[derive(Debug)]
pub struct RegistrationOutcome {
    /// The deformed template.
    pub template: Mesh,
    /// The scan, centered and rotated into the template's frame.
    pub scan: Mesh,
    /// Total non-rigid iterations performed.
    pub iterations: usize,
    /// Mean distance between corresponding landmarks after the run.
    pub landmark_error: f64,
}

/// Drives the full registration sequence.
///
/// Owns both meshes exclusively for the duration of the run. The spatial
/// index is an owned field: it is rebuilt by `build_index` and dropped with
/// the pipeline.
pub struct RegistrationPipeline {
    template: Mesh,
    scan: Mesh,
    template_landmarks: LandmarkSet,
    scan_landmarks: LandmarkSet,
    boundary: Vec<u32>,
    is_boundary: Vec<bool>,
    index: Option<SpatialIndex>,
    scan_points: Vec<Point3<f64>>,
    stage: PipelineStage,
    iterations_run: usize,
}

impl RegistrationPipeline {
    /// Create a pipeline, validating all inputs up front.
    ///
    /// Checks that both meshes are non-empty with consistent face indices,
    /// that the landmark sets correspond positionally with at least three
    /// entries, and that the template has a single open boundary loop. Any
    /// failed assumption is reported here rather than mid-run.
    pub fn new(
        template: Mesh,
        scan: Mesh,
        template_landmarks: LandmarkSet,
        scan_landmarks: LandmarkSet,
    ) -> RegistrationResult<Self> {
        if template.is_empty() {
            return Err(RegistrationError::EmptyMesh {
                details: "template has no vertices or faces".to_string(),
            });
        }
        if scan.is_empty() {
            return Err(RegistrationError::EmptyMesh {
                details: "scan has no vertices or faces".to_string(),
            });
        }
        template.validate_faces()?;
        scan.validate_faces()?;

        if template_landmarks.len() != scan_landmarks.len() {
            return Err(RegistrationError::LandmarkCountMismatch {
                template: template_landmarks.len(),
                scan: scan_landmarks.len(),
            });
        }
        if template_landmarks.len() < rigid::MIN_LANDMARKS {
            return Err(RegistrationError::InsufficientLandmarks {
                required: rigid::MIN_LANDMARKS,
                provided: template_landmarks.len(),
            });
        }
        template_landmarks.validate_against(&template)?;
        scan_landmarks.validate_against(&scan)?;

        // Topology is immutable during the run, so the boundary is computed
        // once up front.
        let boundary = boundary_loop(&template)?;
        let is_boundary = boundary_mask(template.vertex_count(), &boundary);

        log_mesh_stats(&template, "pipeline template");
        log_mesh_stats(&scan, "pipeline scan");

        Ok(Self {
            template,
            scan,
            template_landmarks,
            scan_landmarks,
            boundary,
            is_boundary,
            index: None,
            scan_points: Vec::new(),
            stage: PipelineStage::Unaligned,
            iterations_run: 0,
        })
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// The template in its current (possibly deformed) state.
    #[must_use]
    pub fn template(&self) -> &Mesh {
        &self.template
    }

    /// The scan in its current (possibly centered/rotated) state.
    #[must_use]
    pub fn scan(&self) -> &Mesh {
        &self.scan
    }

    /// Ordered boundary loop of the template.
    #[must_use]
    pub fn boundary(&self) -> &[u32] {
        &self.boundary
    }

    /// Total non-rigid iterations performed so far.
    #[must_use]
    pub fn iterations_run(&self) -> usize {
        self.iterations_run
    }

    /// Consume the pipeline, yielding (template, scan).
    #[must_use]
    pub fn into_meshes(self) -> (Mesh, Mesh) {
        (self.template, self.scan)
    }

    fn require_stage(&self, expected: PipelineStage, operation: &str) -> RegistrationResult<()> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(RegistrationError::InvalidParameter(format!(
                "{operation} requires the {expected:?} stage, but the pipeline is {:?}",
                self.stage
            )))
        }
    }

    /// Center both meshes on their landmark centroids and scale the template
    /// so its mean landmark-to-centroid distance matches the scan's.
    ///
    /// Transitions Unaligned → Rescaled.
    pub fn rescale(&mut self) -> RegistrationResult<()> {
        self.require_stage(PipelineStage::Unaligned, "rescale")?;
        let _timer = OperationTimer::new("rescale");

        let template_points = self.template_landmarks.resolve(&self.template)?;
        let scan_points = self.scan_landmarks.resolve(&self.scan)?;

        let factor = rigid::rescale_factor(&template_points, &scan_points)?;
        rigid::center_and_rescale(&mut self.template, &template_points, factor);
        rigid::center_and_rescale(&mut self.scan, &scan_points, 1.0);

        info!(
            target: "face_registration::pipeline",
            factor,
            "rescaled template to match scan landmark spread"
        );
        self.stage = PipelineStage::Rescaled;
        Ok(())
    }

    /// Rotate the scan into the template's frame using the landmark
    /// Procrustes rotation.
    ///
    /// Transitions Rescaled → RigidlyAligned.
    pub fn rigid_align(&mut self) -> RegistrationResult<()> {
        self.require_stage(PipelineStage::Rescaled, "rigid_align")?;
        let _timer = OperationTimer::new("rigid_align");

        let template_points = self.template_landmarks.resolve(&self.template)?;
        let scan_points = self.scan_landmarks.resolve(&self.scan)?;

        // R maps scan landmarks onto template landmarks; both sets are
        // centered on the origin after rescale, so rotating about the origin
        // is the full alignment.
        let rotation = rigid::compute_rotation(&scan_points, &template_points)?;
        rigid::apply_rotation(&mut self.scan, &rotation);

        self.stage = PipelineStage::RigidlyAligned;
        Ok(())
    }

    /// Build the spatial index over the (rotated) scan vertices.
    ///
    /// Transitions RigidlyAligned → IndexBuilt.
    pub fn build_index(&mut self) -> RegistrationResult<()> {
        self.require_stage(PipelineStage::RigidlyAligned, "build_index")?;
        let _timer = OperationTimer::new("build_index");

        self.scan_points = self.scan.points();
        self.index = Some(SpatialIndex::build(&self.scan_points));

        self.stage = PipelineStage::IndexBuilt;
        Ok(())
    }

    /// Run `params.iterations` non-rigid steps.
    ///
    /// The first step of each call uses `epsilon_initial`, the rest use
    /// `epsilon_refine`. Transitions IndexBuilt → NonRigidIterating →
    /// Converged; may be called again on a converged pipeline.
    pub fn iterate(&mut self, params: &RegistrationParams) -> RegistrationResult<()> {
        if self.stage != PipelineStage::IndexBuilt && self.stage != PipelineStage::Converged {
            return Err(RegistrationError::InvalidParameter(format!(
                "iterate requires the IndexBuilt or Converged stage, but the pipeline is {:?}",
                self.stage
            )));
        }
        params.validate()?;
        let _timer = OperationTimer::new("non_rigid_iterate");

        for k in 0..params.iterations {
            let epsilon = if k == 0 {
                params.epsilon_initial
            } else {
                params.epsilon_refine
            };
            self.stage = PipelineStage::NonRigidIterating;
            self.step(epsilon, params)?;
        }

        self.stage = PipelineStage::Converged;
        Ok(())
    }

    /// One non-rigid step with the given proximity threshold.
    fn step(&mut self, epsilon: f64, params: &RegistrationParams) -> RegistrationResult<()> {
        let index = self.index.as_ref().ok_or_else(|| {
            RegistrationError::InvalidParameter(
                "spatial index missing; call build_index first".to_string(),
            )
        })?;

        // Cotangent weights depend on the current positions, so the
        // Laplacian is rebuilt every step.
        let laplacian = cotangent_laplacian(&self.template);
        let positions = self.template.positions();

        let landmark_targets = if params.use_landmarks {
            Some(self.scan_landmarks.resolve(&self.scan)?)
        } else {
            None
        };
        let landmark_pairs = landmark_targets
            .as_deref()
            .map(|targets| (&self.template_landmarks, targets));

        let block = assemble_constraints(
            &self.template,
            &self.is_boundary,
            landmark_pairs,
            index,
            &self.scan_points,
            epsilon,
        )?;

        let solved = solve_nonrigid(
            &laplacian,
            &positions,
            &block,
            params.lambda,
            params.strategy,
            self.iterations_run,
        )?;
        self.template.set_positions(&solved)?;
        self.iterations_run += 1;

        debug!(
            target: "face_registration::pipeline",
            iteration = self.iterations_run,
            epsilon,
            closest_point_rows = block.closest_point_rows,
            landmark_error = self.landmark_error().unwrap_or(f64::NAN),
            "completed non-rigid step"
        );
        Ok(())
    }

    /// Mean distance between corresponding template and scan landmarks in
    /// their current positions.
    pub fn landmark_error(&self) -> RegistrationResult<f64> {
        let template_points = self.template_landmarks.resolve(&self.template)?;
        let scan_points = self.scan_landmarks.resolve(&self.scan)?;
        let count = template_points.len().max(1) as f64;
        Ok(template_points
            .iter()
            .zip(&scan_points)
            .map(|(t, s)| (t - s).norm())
            .sum::<f64>()
            / count)
    }
}

/// Register a template mesh onto a scan in one call.
///
/// Runs the full sequence — rescale, rigid alignment (rotating the scan into
/// the template's frame), index construction, and the two-phase non-rigid
/// iterations — and returns the deformed template together with the aligned
/// scan.
///
/// Both meshes are taken by value: the pipeline owns them exclusively during
/// the run and hands them back in the outcome.
pub fn register(
    template: Mesh,
    scan: Mesh,
    template_landmarks: &LandmarkSet,
    scan_landmarks: &LandmarkSet,
    params: &RegistrationParams,
) -> RegistrationResult<RegistrationOutcome> {
    let mut pipeline = RegistrationPipeline::new(
        template,
        scan,
        template_landmarks.clone(),
        scan_landmarks.clone(),
    )?;

    pipeline.rescale()?;
    pipeline.rigid_align()?;
    pipeline.build_index()?;
    pipeline.iterate(params)?;

    let landmark_error = pipeline.landmark_error()?;
    let iterations = pipeline.iterations_run();
    let (template, scan) = pipeline.into_meshes();

    info!(
        target: "face_registration::pipeline",
        iterations,
        landmark_error,
        "registration complete"
    );

    Ok(RegistrationOutcome {
        template,
        scan,
        iterations,
        landmark_error,
    })
}
