pub mod acquisition;
pub mod cfl_io;
pub mod dti;
pub mod error;
pub mod fwdti;
pub mod metrics;
pub mod phantom;
pub mod tensor;
pub mod volume;
pub mod workflow;

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use acquisition::AcquisitionScheme;
pub use dti::{DtiFit, DtiFitMethod, FitStatus, TensorModel};
pub use error::{FwdtiError, Result};
pub use fwdti::{FitMethod, FreeWaterConfig, FreeWaterFitResult, FreeWaterTensorEstimator};
pub use metrics::TensorScalars;
pub use tensor::DiffusionTensor;
pub use workflow::{calc_scalars, fwdti_exec, CalcScalarsArgs, FitReport};

/// Fit parameters, stored as a toml file next to the data set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FwdtiParams {
    /// b-values at or below this are b0 measurements (s/mm^2)
    pub b0_threshold: f64,
    /// b-values closer than this belong to the same shell (s/mm^2)
    pub shell_tolerance: f64,
    /// measurements above this b-value (s/mm^2) are left out of the fit. All shells are used if not set
    pub max_bval: Option<f64>,
    /// model used for the reference (single compartment) tensor fit
    pub dti_method: DtiFitMethod,
    /// size of the rayon thread pool. Uses all cores if not set
    pub n_threads: Option<usize>,
    /// voxels still waiting after this many seconds are marked as not converged
    pub timeout_secs: Option<f64>,
    pub free_water: FreeWaterConfig,
}

impl Default for FwdtiParams {
    fn default() -> Self {
        Self {
            b0_threshold: 50.,
            shell_tolerance: 20.,
            max_bval: None,
            dti_method: DtiFitMethod::Wls,
            n_threads: None,
            timeout_secs: None,
            free_water: FreeWaterConfig::default(),
        }
    }
}

/// Data set to fit and where to put the results
#[derive(Debug, Clone, Parser)]
pub struct DataSetParams {
    /// 4-D cfl image (nx, ny, nz, nq) with one volume per measurement
    #[arg(long, required_unless_present = "volumes", conflicts_with = "volumes")]
    pub data: Option<PathBuf>,
    /// glob pattern matching one 3-D cfl volume per measurement, in measurement order when sorted
    #[arg(long)]
    pub volumes: Option<String>,
    /// FSL style b-value file
    #[arg(long)]
    pub bvals: PathBuf,
    /// FSL style gradient direction file
    #[arg(long)]
    pub bvecs: PathBuf,
    /// 3-D cfl mask. Non-zero voxels are fitted. All voxels are fitted if not set
    #[arg(long)]
    pub mask: Option<PathBuf>,
    /// only fit voxels of this axial (z) slice
    #[arg(long)]
    pub axial_slice: Option<usize>,
    /// toml parameter file (see fwdti-params)
    #[arg(long)]
    pub fit_params: PathBuf,
    /// directory for output maps and the fit report
    pub output_dir: PathBuf,
}
