// Synthetic two-compartment diffusion data for testing and for generating example data sets

use crate::acquisition::AcquisitionScheme;
use crate::cfl_io::write_cfl;
use crate::dti::FitStatus;
use crate::error::{FwdtiError, Result};
use crate::fwdti::FreeWaterFitResult;
use crate::tensor::DiffusionTensor;
use crate::volume::SampleMask;
use ndarray::{Array3, Array4, ShapeBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;

/// b-values at or below this are treated as b0 in generated schemes
pub const PHANTOM_B0_THRESHOLD: f64 = 50.;

/// n roughly uniform directions on the upper hemisphere (golden angle spiral)
pub fn hemisphere_directions(n: usize) -> Vec<[f64; 3]> {
    let golden_angle = PI * (3. - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let z = 1. - (i as f64 + 0.5) / n as f64;
            let r = (1. - z * z).sqrt();
            let theta = golden_angle * i as f64;
            [r * theta.cos(), r * theta.sin(), z]
        })
        .collect()
}

/// Builds a scheme with n_b0 reference measurements for every b0 entry of `bvals` and n_dirs
/// gradient directions for every weighted shell
pub fn multi_shell_scheme(bvals: &[f64], n_dirs: usize, n_b0: usize) -> Result<AcquisitionScheme> {
    let dirs = hemisphere_directions(n_dirs);
    let mut b = vec![];
    let mut g = vec![];
    for &shell in bvals {
        if shell <= PHANTOM_B0_THRESHOLD {
            b.extend(std::iter::repeat(shell).take(n_b0));
            g.extend(std::iter::repeat([0., 0., 0.]).take(n_b0));
        } else {
            b.extend(std::iter::repeat(shell).take(n_dirs));
            g.extend_from_slice(&dirs);
        }
    }
    AcquisitionScheme::new(b, g, PHANTOM_B0_THRESHOLD)
}

/// noise free two-compartment signal for every measurement of the scheme
pub fn synthesize_signal(scheme: &AcquisitionScheme, tensor: &DiffusionTensor, f: f64, s0: f64, isotropic_diffusivity: f64) -> Vec<f64> {
    scheme
        .bvals()
        .iter()
        .zip(scheme.bvecs())
        .map(|(&b, g)| {
            let tissue = (-b * tensor.apparent_diffusivity(g)).exp();
            let water = (-b * isotropic_diffusivity).exp();
            s0 * ((1. - f) * tissue + f * water)
        })
        .collect()
}

/// replaces every value with the magnitude of itself plus complex gaussian noise of std sigma
pub fn add_rician_noise(signal: &mut [f64], sigma: f64, rng: &mut impl Rng) {
    if sigma <= 0. {
        return;
    }
    signal.iter_mut().for_each(|s| {
        let n1: f64 = rng.sample(StandardNormal);
        let n2: f64 = rng.sample(StandardNormal);
        *s = ((*s + sigma * n1).powi(2) + (sigma * n2).powi(2)).sqrt();
    });
}

/// sample the unit sphere with 2 random variables u1 and u2 assumed to be uniformly
/// distributed on the interval [0,1)
fn sample_unit_sphere(u1: f64, u2: f64) -> [f64; 3] {
    let theta = 2.0 * PI * u1;
    let phi = (2.0 * u2 - 1.0).acos();
    [phi.sin() * theta.cos(), phi.sin() * theta.sin(), phi.cos()]
}

fn sample_range(u1: f64, lower_bound: f64, upper_bound: f64) -> f64 {
    (upper_bound - lower_bound) * u1 + lower_bound
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhantomParams {
    pub dims: [usize; 3],
    pub bvals: Vec<f64>,
    pub n_dirs: usize,
    pub n_b0: usize,
    pub s0: f64,
    /// free water fraction grows linearly along x from 0 to max_f
    pub max_f: f64,
    pub axial_diffusivity: [f64; 2],
    pub radial_diffusivity: [f64; 2],
    pub isotropic_diffusivity: f64,
    pub noise_sigma: f64,
    pub seed: u64,
}

impl Default for PhantomParams {
    fn default() -> Self {
        Self {
            dims: [8, 8, 2],
            bvals: vec![0., 200., 400., 1000., 2000.],
            n_dirs: 32,
            n_b0: 6,
            s0: 1000.,
            max_f: 0.8,
            axial_diffusivity: [1.2e-3, 1.8e-3],
            radial_diffusivity: [0.2e-3, 0.6e-3],
            isotropic_diffusivity: 3.0e-3,
            noise_sigma: 0.,
            seed: 0,
        }
    }
}

/// A synthetic data set together with the parameters it was generated from
#[derive(Debug, Clone)]
pub struct Phantom {
    pub scheme: AcquisitionScheme,
    /// (nx, ny, nz, nq) column-major signal
    pub data: Array4<f32>,
    pub mask: SampleMask,
    pub truth: Vec<FreeWaterFitResult>,
}

/// Generates a phantom with a random fiber direction and random diffusivities per voxel. The
/// same seed always gives the same data.
pub fn generate_phantom(params: &PhantomParams) -> Result<Phantom> {
    let scheme = multi_shell_scheme(&params.bvals, params.n_dirs, params.n_b0)?;
    let [nx, ny, nz] = params.dims;
    let n_vox = nx * ny * nz;
    if n_vox == 0 {
        return Err(FwdtiError::config("phantom dimensions must be non-zero"));
    }
    let nq = scheme.len();
    let mut rng = StdRng::seed_from_u64(params.seed);

    let mut data = Array4::<f32>::zeros((nx, ny, nz, nq).f());
    let mut truth = Vec::with_capacity(n_vox);
    {
        let d = data
            .as_slice_memory_order_mut()
            .ok_or_else(|| FwdtiError::Shape("phantom array is not contiguous".to_string()))?;
        for i in 0..n_vox {
            let ix = i % nx;
            let f = if nx > 1 { params.max_f * ix as f64 / (nx - 1) as f64 } else { 0. };
            let dir = sample_unit_sphere(rng.random(), rng.random());
            let ad = sample_range(rng.random(), params.axial_diffusivity[0], params.axial_diffusivity[1]);
            let rd = sample_range(rng.random(), params.radial_diffusivity[0], params.radial_diffusivity[1]);
            let tensor = DiffusionTensor::from_principal_direction(&dir, [ad, rd, rd]);

            let mut signal = synthesize_signal(&scheme, &tensor, f, params.s0, params.isotropic_diffusivity);
            add_rician_noise(&mut signal, params.noise_sigma, &mut rng);
            for (v_idx, s) in signal.iter().enumerate() {
                d[v_idx * n_vox + i] = *s as f32;
            }
            truth.push(FreeWaterFitResult {
                tensor,
                f,
                s0: params.s0,
                status: FitStatus::Fitted,
            });
        }
    }

    Ok(Phantom {
        scheme,
        data,
        mask: SampleMask::full(params.dims),
        truth,
    })
}

impl Phantom {
    /// column-major map of a per-voxel ground truth value
    pub fn truth_map(&self, value: impl Fn(&FreeWaterFitResult) -> f64) -> Array3<f32> {
        let [nx, ny, nz] = self.mask.dims();
        Array3::from_shape_fn((nx, ny, nz).f(), |(x, y, z)| value(&self.truth[x + nx * (y + ny * z)]) as f32)
    }

    /// Writes the data set (`data`, `mask`, `bvals`, `bvecs`) and its ground truth maps (`truth_f`,
    /// `truth_fa`, `truth_md`) to a directory
    pub fn write(&self, output_dir: impl AsRef<Path>) -> Result<()> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir).map_err(|e| FwdtiError::io(output_dir, e))?;
        write_cfl(output_dir.join("data"), &self.data)?;
        write_cfl(output_dir.join("mask"), &self.truth_map(|_| 1.))?;
        self.scheme
            .write_fsl_files(output_dir.join("bvals"), output_dir.join("bvecs"))?;
        write_cfl(output_dir.join("truth_f"), &self.truth_map(|t| t.f))?;
        write_cfl(output_dir.join("truth_fa"), &self.truth_map(|t| t.fa()))?;
        write_cfl(output_dir.join("truth_md"), &self.truth_map(|t| t.md()))
    }
}
