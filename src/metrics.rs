// Scalar diffusion metrics derived from tensor eigenvalues

use crate::tensor::DiffusionTensor;
use serde::{Deserialize, Serialize};

/// sorts eigenvalues in descending order and clips negative (noise driven) values to zero
fn clean_eigenvalues(evals: &[f64; 3]) -> [f64; 3] {
    let mut e = evals.map(|v| if v.is_finite() { v.max(0.) } else { 0. });
    e.sort_by(|a, b| b.total_cmp(a));
    e
}

pub fn mean_diffusivity(evals: &[f64; 3]) -> f64 {
    let [l1, l2, l3] = clean_eigenvalues(evals);
    (l1 + l2 + l3) / 3.
}

pub fn axial_diffusivity(evals: &[f64; 3]) -> f64 {
    clean_eigenvalues(evals)[0]
}

pub fn radial_diffusivity(evals: &[f64; 3]) -> f64 {
    let [_, l2, l3] = clean_eigenvalues(evals);
    (l2 + l3) / 2.
}

/// FA = sqrt(3/2) * |lambda - MD| / |lambda|, zero for a null tensor
pub fn fractional_anisotropy(evals: &[f64; 3]) -> f64 {
    let [l1, l2, l3] = clean_eigenvalues(evals);
    let md = (l1 + l2 + l3) / 3.;
    let num = ((l1 - md).powi(2) + (l2 - md).powi(2) + (l3 - md).powi(2)).sqrt();
    let denom = (l1.powi(2) + l2.powi(2) + l3.powi(2)).sqrt();
    if denom <= 0. {
        return 0.;
    }
    ((3. / 2f64).sqrt() * num / denom).min(1.)
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TensorScalars {
    pub fa: f64,
    pub md: f64,
    pub ad: f64,
    pub rd: f64,
}

impl TensorScalars {
    pub fn from_eigenvalues(evals: &[f64; 3]) -> Self {
        Self {
            fa: fractional_anisotropy(evals),
            md: mean_diffusivity(evals),
            ad: axial_diffusivity(evals),
            rd: radial_diffusivity(evals),
        }
    }

    pub fn from_tensor(tensor: &DiffusionTensor) -> Self {
        Self::from_eigenvalues(&tensor.eigenvalues())
    }
}
