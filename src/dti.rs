// Standard (single compartment) diffusion tensor model, fitted in log space by ordinary or
// weighted linear least squares

use crate::acquisition::{AcquisitionScheme, N_DESIGN_COLS};
use crate::error::{FwdtiError, Result};
use crate::metrics::TensorScalars;
use crate::tensor::DiffusionTensor;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// singular values below this are treated as zero by the pseudo-inverses
pub(crate) const PINV_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtiFitMethod {
    Ols,
    Wls,
}

/// Outcome of a single sample fit. Every sample gets exactly one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// fitted and converged
    Fitted,
    /// signal is dominated by free water: f = 1 and the tissue tensor is zero
    FreeWaterDominated,
    /// the nonlinear refinement did not converge (or the run timed out); values are a fallback
    NotConverged,
    /// non-positive or non-finite signal; the sample is excluded from the output
    InvalidSignal,
    /// outside of the sample mask
    #[default]
    Masked,
}

impl FitStatus {
    /// numeric code stored in status maps
    pub fn code(&self) -> u8 {
        match self {
            FitStatus::Masked => 0,
            FitStatus::Fitted => 1,
            FitStatus::FreeWaterDominated => 2,
            FitStatus::NotConverged => 3,
            FitStatus::InvalidSignal => 4,
        }
    }

    /// true when the sample carries a usable estimate
    pub fn has_estimate(&self) -> bool {
        matches!(self, FitStatus::Fitted | FitStatus::FreeWaterDominated | FitStatus::NotConverged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DtiFit {
    pub tensor: DiffusionTensor,
    pub s0: f64,
    pub status: FitStatus,
}

impl DtiFit {
    pub(crate) fn with_status(status: FitStatus) -> Self {
        Self { status, ..Default::default() }
    }

    /// builds a fit from the log-linear parameter vector [Dxx Dyy Dzz Dxy Dxz Dyz ln(S0)]
    pub(crate) fn from_params(params: &DVector<f64>) -> Self {
        let tensor = DiffusionTensor::new([params[0], params[1], params[2], params[3], params[4], params[5]]);
        let s0 = params[6].exp();
        let status = if tensor.is_finite() && s0.is_finite() {
            FitStatus::Fitted
        } else {
            FitStatus::InvalidSignal
        };
        if status == FitStatus::Fitted {
            Self { tensor, s0, status }
        } else {
            Self::with_status(status)
        }
    }

    pub fn scalars(&self) -> TensorScalars {
        TensorScalars::from_tensor(&self.tensor)
    }
}

/// The classic log-linear tensor model. The design matrix and its pseudo-inverse are computed once
/// and shared (read only) by every sample fit.
#[derive(Debug, Clone)]
pub struct TensorModel {
    design: DMatrix<f64>,
    design_pinv: DMatrix<f64>,
    method: DtiFitMethod,
    min_signal: f64,
}

impl TensorModel {
    pub fn new(scheme: &AcquisitionScheme, method: DtiFitMethod, min_signal: f64) -> Result<Self> {
        scheme.check_tensor_identifiable()?;
        if !(min_signal > 0.) {
            return Err(FwdtiError::config("min_signal must be positive"));
        }
        let design = scheme.design_matrix();
        let design_pinv = design
            .clone()
            .pseudo_inverse(PINV_EPS)
            .map_err(FwdtiError::config)?;
        Ok(Self {
            design,
            design_pinv,
            method,
            min_signal,
        })
    }

    pub fn method(&self) -> DtiFitMethod {
        self.method
    }

    pub fn design(&self) -> &DMatrix<f64> {
        &self.design
    }

    /// fits a single sample. Invalid signals give an InvalidSignal status rather than an error
    pub fn fit_signal(&self, signal: &[f64]) -> DtiFit {
        if signal.len() != self.design.nrows() || !signal_is_valid(signal) {
            return DtiFit::with_status(FitStatus::InvalidSignal);
        }
        let y = log_signal(signal, self.min_signal);
        let ols = &self.design_pinv * &y;
        let params = match self.method {
            DtiFitMethod::Ols => Some(ols),
            DtiFitMethod::Wls => {
                // weights from the OLS-predicted signal
                let weights = (&self.design * &ols).map(|x| x.exp().powi(2));
                weighted_solve(&self.design, &weights)
                    .map(|w| w * &y)
            }
        };
        match params {
            Some(p) => DtiFit::from_params(&p),
            None => DtiFit::with_status(FitStatus::InvalidSignal),
        }
    }

    /// predicted signal for every measurement of the scheme
    pub fn predict(&self, fit: &DtiFit) -> Vec<f64> {
        let mut p = DVector::zeros(N_DESIGN_COLS);
        p.rows_mut(0, 6).copy_from_slice(fit.tensor.coefficients());
        p[6] = fit.s0.max(f64::MIN_POSITIVE).ln();
        (&self.design * p).iter().map(|x| x.exp()).collect()
    }
}

/// a sample is usable when all entries are finite and strictly positive
pub(crate) fn signal_is_valid(signal: &[f64]) -> bool {
    !signal.is_empty() && signal.iter().all(|s| s.is_finite() && *s > 0.)
}

/// signal attenuation in log space, floored at min_signal
pub(crate) fn log_signal(signal: &[f64], min_signal: f64) -> DVector<f64> {
    DVector::from_iterator(signal.len(), signal.iter().map(|s| s.max(min_signal).ln()))
}

/// Returns the operator (W^1/2 A)^+ W^1/2 mapping a log signal to the weighted least squares
/// parameters, with W = diag(weights)
pub(crate) fn weighted_solve(design: &DMatrix<f64>, weights: &DVector<f64>) -> Option<DMatrix<f64>> {
    let sqrt_w = weights.map(|w| w.max(0.).sqrt());
    let mut wa = design.clone();
    for (mut row, &w) in wa.row_iter_mut().zip(sqrt_w.iter()) {
        row *= w;
    }
    let mut op = wa.pseudo_inverse(PINV_EPS).ok()?;
    for (mut col, &w) in op.column_iter_mut().zip(sqrt_w.iter()) {
        col *= w;
    }
    op.iter().all(|x| x.is_finite()).then_some(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phantom::{multi_shell_scheme, synthesize_signal};
    use approx::assert_relative_eq;

    fn ground_truth() -> DiffusionTensor {
        DiffusionTensor::from_principal_direction(&[0.4, 0.8, 0.3], [1.6e-3, 0.45e-3, 0.3e-3])
    }

    #[test]
    fn wls_recovers_noise_free_tensor() {
        let scheme = multi_shell_scheme(&[0., 1000.], 30, 1).unwrap();
        let truth = ground_truth();
        let signal = synthesize_signal(&scheme, &truth, 0., 800., 3e-3);
        for method in [DtiFitMethod::Ols, DtiFitMethod::Wls] {
            let model = TensorModel::new(&scheme, method, 1e-6).unwrap();
            let fit = model.fit_signal(&signal);
            assert_eq!(fit.status, FitStatus::Fitted);
            assert_relative_eq!(fit.s0, 800., max_relative = 1e-9);
            for (a, b) in fit.tensor.coefficients().iter().zip(truth.coefficients()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn prediction_reproduces_noise_free_signal() {
        let scheme = multi_shell_scheme(&[0., 1000., 2000.], 20, 2).unwrap();
        let truth = ground_truth();
        let signal = synthesize_signal(&scheme, &truth, 0., 1.0, 3e-3);
        let model = TensorModel::new(&scheme, DtiFitMethod::Wls, 1e-6).unwrap();
        let fit = model.fit_signal(&signal);
        for (p, s) in model.predict(&fit).iter().zip(&signal) {
            assert_relative_eq!(p, s, max_relative = 1e-9);
        }
    }

    #[test]
    fn invalid_signal_is_flagged() {
        let scheme = multi_shell_scheme(&[0., 1000.], 12, 1).unwrap();
        let model = TensorModel::new(&scheme, DtiFitMethod::Wls, 1e-6).unwrap();
        let mut signal = vec![1.0; scheme.len()];
        signal[3] = 0.;
        assert_eq!(model.fit_signal(&signal).status, FitStatus::InvalidSignal);
        signal[3] = f64::NAN;
        assert_eq!(model.fit_signal(&signal).status, FitStatus::InvalidSignal);
        assert_eq!(model.fit_signal(&signal[..4]).status, FitStatus::InvalidSignal);
    }

    #[test]
    fn too_few_directions_is_a_configuration_error() {
        let scheme = multi_shell_scheme(&[0., 1000.], 4, 1).unwrap();
        assert!(matches!(
            TensorModel::new(&scheme, DtiFitMethod::Ols, 1e-6),
            Err(FwdtiError::Configuration(_))
        ));
    }
}
