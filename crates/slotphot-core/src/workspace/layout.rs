use tracing::info;

use crate::error::Result;
use crate::workspace::{SharedArray, Workspace};

/// Shapes of the modelling buffers for one pipeline phase.
///
/// The sample-fitting phase and the full-cube phase use the same buffer names
/// with different leading dimensions, so each phase states its layout
/// explicitly instead of inferring it from the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkspaceLayout {
    /// One row per sample image in every buffer.
    SampleFit {
        n_samples: usize,
        frame_shape: (usize, usize),
        dof: usize,
        n_knots: usize,
        n_streaks: usize,
        ftb_width: usize,
    },
    /// One fit row per block of `n_comb` frames; one residual and bleed row
    /// per frame.
    FullCube {
        n_frames: usize,
        n_blocks: usize,
        frame_shape: (usize, usize),
        dof: usize,
        n_knots: usize,
        n_streaks: usize,
        ftb_width: usize,
    },
}

impl WorkspaceLayout {
    /// Rows of the `params`, `knots` and `gof` buffers.
    pub fn fit_rows(&self) -> usize {
        match *self {
            Self::SampleFit { n_samples, .. } => n_samples,
            Self::FullCube { n_blocks, .. } => n_blocks,
        }
    }

    /// Rows of the `residuals` and `bleeding` buffers.
    pub fn residual_rows(&self) -> usize {
        match *self {
            Self::SampleFit { n_samples, .. } => n_samples,
            Self::FullCube { n_frames, .. } => n_frames,
        }
    }

    fn dims(&self) -> ((usize, usize), usize, usize, usize, usize) {
        match *self {
            Self::SampleFit {
                frame_shape,
                dof,
                n_knots,
                n_streaks,
                ftb_width,
                ..
            }
            | Self::FullCube {
                frame_shape,
                dof,
                n_knots,
                n_streaks,
                ftb_width,
                ..
            } => (frame_shape, dof, n_knots, n_streaks, ftb_width),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SampleFit { .. } => "sample-fit",
            Self::FullCube { .. } => "full-cube",
        }
    }
}

/// The five modelling buffers of a phase.
pub struct ModellingBuffers {
    pub layout: WorkspaceLayout,
    /// Fitted coefficients, NaN until written.
    pub params: SharedArray<f64>,
    /// Interior knot positions, rows then columns.
    pub knots: SharedArray<i64>,
    /// Reduced chi-square per fit, NaN until written.
    pub gof: SharedArray<f64>,
    /// Bleed coefficients per streak.
    pub bleeding: SharedArray<f64>,
    /// Background and bleed subtracted images.
    pub residuals: SharedArray<f64>,
}

impl ModellingBuffers {
    pub fn allocate(workspace: &Workspace, layout: WorkspaceLayout, clobber: bool) -> Result<Self> {
        let ((h, w), dof, n_knots, n_streaks, ftb_width) = layout.dims();
        let n_fit = layout.fit_rows();
        let n_resi = layout.residual_rows();

        let buffers = Self {
            layout,
            params: workspace.allocate("params", &[n_fit, dof], f64::NAN, clobber)?,
            knots: workspace.allocate("knots", &[n_fit, n_knots], 0i64, clobber)?,
            gof: workspace.allocate("gof", &[n_fit], f64::NAN, clobber)?,
            bleeding: workspace.allocate(
                "bleeding",
                &[n_resi, n_streaks, ftb_width],
                f64::NAN,
                clobber,
            )?,
            residuals: workspace.allocate("residuals", &[n_resi, h, w], f64::NAN, clobber)?,
        };
        info!(
            layout = layout.name(),
            folder = %workspace.folder().display(),
            fit_rows = n_fit,
            residual_rows = n_resi,
            dof,
            "Allocated modelling buffers"
        );
        Ok(buffers)
    }

    pub fn flush(&self) -> Result<()> {
        self.params.flush()?;
        self.knots.flush()?;
        self.gof.flush()?;
        self.bleeding.flush()?;
        self.residuals.flush()
    }

    /// Goodness of fit of every row, NaN where no fit was stored.
    pub fn gof_values(&self) -> Vec<f64> {
        (0..self.gof.rows())
            .map(|i| self.gof.get(i).unwrap_or(f64::NAN))
            .collect()
    }
}
