use std::path::PathBuf;

use crate::{
    input::Input,
    process::{ProcessChain, ToolError},
    scenes::Scene,
};

pub mod vmaf;

/// The encoded side of a quality comparison.
#[derive(Debug, Clone)]
pub enum Candidate {
    /// An encoded file on disk.
    File(PathBuf),
    /// A chain producing the encoded stream on stdout, consumed by the prober.
    Stream(ProcessChain),
}

#[derive(Debug, Clone, Copy)]
pub struct MeasureRequest<'a> {
    pub input:     &'a Input,
    pub scene:     Scene,
    pub candidate: &'a Candidate,
    /// Evaluate every Nth frame.
    pub subsample: usize,
}

/// Quality Prober: compares a candidate against the source range.
pub trait MeasureQuality: Sync {
    /// Single pooled score.
    fn aggregate(&self, request: &MeasureRequest<'_>) -> Result<f64, ToolError>;

    /// One score per evaluated frame.
    fn per_frame(&self, request: &MeasureRequest<'_>) -> Result<Vec<f64>, ToolError>;
}
