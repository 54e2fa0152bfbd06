// Free water elimination diffusion tensor model.
//
// S = S0 [(1 - f) exp(-b g^T D g) + f exp(-b Diso)]
//
// Fitted per sample by a weighted linear least squares grid search over f, optionally refined by
// nonlinear least squares (Levenberg-Marquardt) over D, S0 and f jointly.

use crate::acquisition::AcquisitionScheme;
use crate::dti::{log_signal, signal_is_valid, weighted_solve, DtiFit, FitStatus};
use crate::error::{FwdtiError, Result};
use crate::metrics::TensorScalars;
use crate::tensor::{cholesky_jacobian, cholesky_to_coefficients, DiffusionTensor};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{Const, DMatrix, DVector, Dyn, OMatrix, OVector, Owned, U8};
use serde::{Deserialize, Serialize};

/// f values above this after the grid search are not refined any further
const NLS_MAX_INITIAL_F: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMethod {
    /// weighted linear least squares with a coarse-to-fine grid search over f
    Wls,
    /// WLS initialization followed by nonlinear least squares refinement
    Nls,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeWaterConfig {
    pub fit_method: FitMethod,
    /// parameterize the tensor by its Cholesky factor during refinement (keeps it positive semi-definite)
    pub cholesky: bool,
    /// optimize over an angle phi with f = (1 - cos(phi)) / 2 so f stays in [0, 1]
    pub f_transform: bool,
    /// diffusivity of the free water compartment (mm^2/s)
    pub isotropic_diffusivity: f64,
    /// samples with a naive mean diffusivity above this are treated as pure free water
    pub md_regularization: f64,
    /// signal floor used before taking logarithms
    pub min_signal: f64,
    /// number of coarse-to-fine passes of the f grid search
    pub grid_iterations: usize,
    /// the optimizer gives up after patience * (n_params + 1) evaluations
    pub patience: usize,
}

impl Default for FreeWaterConfig {
    fn default() -> Self {
        Self {
            fit_method: FitMethod::Nls,
            cholesky: false,
            f_transform: true,
            isotropic_diffusivity: 3.0e-3,
            md_regularization: 2.7e-3,
            min_signal: 1.0e-6,
            grid_iterations: 3,
            patience: 100,
        }
    }
}

impl FreeWaterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.isotropic_diffusivity > 0. && self.isotropic_diffusivity.is_finite()) {
            return Err(FwdtiError::config("isotropic diffusivity must be positive"));
        }
        if !(self.md_regularization > 0.) {
            return Err(FwdtiError::config("md regularization must be positive"));
        }
        if !(self.min_signal > 0.) {
            return Err(FwdtiError::config("min_signal must be positive"));
        }
        if self.grid_iterations == 0 {
            return Err(FwdtiError::config("at least one grid iteration is required"));
        }
        if self.patience == 0 {
            return Err(FwdtiError::config("patience must be non-zero"));
        }
        Ok(())
    }
}

/// Per-sample estimate of the free water elimination model
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FreeWaterFitResult {
    /// tissue compartment tensor
    pub tensor: DiffusionTensor,
    /// free water volume fraction in [0, 1]
    pub f: f64,
    pub s0: f64,
    pub status: FitStatus,
}

impl FreeWaterFitResult {
    pub fn with_status(status: FitStatus) -> Self {
        Self { status, ..Default::default() }
    }

    pub fn scalars(&self) -> TensorScalars {
        TensorScalars::from_tensor(&self.tensor)
    }

    pub fn fa(&self) -> f64 {
        self.scalars().fa
    }

    pub fn md(&self) -> f64 {
        self.scalars().md
    }

    pub fn ad(&self) -> f64 {
        self.scalars().ad
    }

    pub fn rd(&self) -> f64 {
        self.scalars().rd
    }
}

/// result of the linear stage, used as the starting point of the refinement
#[derive(Debug, Clone)]
struct WlsEstimate {
    params: DVector<f64>,
    f: f64,
}

/// Estimator for the free water elimination model. Holds only read-only data derived from the
/// acquisition scheme, so a single instance can be shared by any number of worker threads.
#[derive(Debug, Clone)]
pub struct FreeWaterTensorEstimator {
    scheme: AcquisitionScheme,
    config: FreeWaterConfig,
    design: DMatrix<f64>,
    /// exp(-b Diso) per measurement
    fw_decay: DVector<f64>,
}

impl FreeWaterTensorEstimator {
    /// Validates the scheme and the configuration. An acquisition with fewer than 2 distinct
    /// non-zero shells cannot separate the two compartments and is rejected here.
    pub fn new(scheme: &AcquisitionScheme, config: FreeWaterConfig, shell_tolerance: f64) -> Result<Self> {
        config.validate()?;
        scheme.check_free_water_identifiable(shell_tolerance)?;
        let design = scheme.design_matrix();
        let fw_decay = DVector::from_iterator(
            scheme.len(),
            scheme.bvals().iter().map(|b| (-b * config.isotropic_diffusivity).exp()),
        );
        Ok(Self {
            scheme: scheme.clone(),
            config,
            design,
            fw_decay,
        })
    }

    pub fn config(&self) -> &FreeWaterConfig {
        &self.config
    }

    pub fn scheme(&self) -> &AcquisitionScheme {
        &self.scheme
    }

    /// fits one sample. Never fails: problems are reported through the result status
    pub fn fit_signal(&self, signal: &[f64]) -> FreeWaterFitResult {
        if signal.len() != self.scheme.len() || !signal_is_valid(signal) {
            return FreeWaterFitResult::with_status(FitStatus::InvalidSignal);
        }
        let min_signal = self.config.min_signal;
        let sig = DVector::from_column_slice(signal);
        let s0 = self.scheme.mean_b0(signal);
        if s0 <= min_signal || sig.mean() <= min_signal {
            return FreeWaterFitResult::with_status(FitStatus::InvalidSignal);
        }

        // weights from the measured signal
        let weights = sig.map(|s| s * s);
        let Some(op) = weighted_solve(&self.design, &weights) else {
            return FreeWaterFitResult::with_status(FitStatus::InvalidSignal);
        };

        let naive = DtiFit::from_params(&(&op * log_signal(signal, min_signal)));
        if naive.status != FitStatus::Fitted {
            return FreeWaterFitResult::with_status(FitStatus::InvalidSignal);
        }
        let naive_md = naive.tensor.trace() / 3.;
        if !(naive_md < self.config.md_regularization) {
            return FreeWaterFitResult {
                tensor: DiffusionTensor::zeros(),
                f: 1.,
                s0,
                status: FitStatus::FreeWaterDominated,
            };
        }

        let wls = self.grid_search(&sig, s0, &op);

        let fitted = match self.config.fit_method {
            FitMethod::Nls if wls.f < NLS_MAX_INITIAL_F => self.refine(&sig, s0, &wls),
            _ => Some(result_from_params(&wls.params, wls.f)),
        };

        match fitted {
            Some(r) => r,
            None => FreeWaterFitResult {
                tensor: naive.tensor,
                f: 0.,
                s0: naive.s0,
                status: FitStatus::NotConverged,
            },
        }
    }

    /// predicted signal for every measurement of the scheme
    pub fn predict(&self, fit: &FreeWaterFitResult) -> Vec<f64> {
        let d = fit.tensor.coefficients();
        (0..self.scheme.len())
            .map(|i| {
                let e = tissue_decay(&self.design, i, d);
                fit.s0 * ((1. - fit.f) * e + fit.f * self.fw_decay[i])
            })
            .collect()
    }

    /// Coarse-to-fine search over f. For each candidate the free water contribution is removed
    /// and the remaining tissue signal is fitted log-linearly. The candidate with the smallest
    /// signal residual wins and the grid is refined around it.
    fn grid_search(&self, sig: &DVector<f64>, s0: f64, op: &DMatrix<f64>) -> WlsEstimate {
        let min_signal = self.config.min_signal;
        let n = sig.len();

        let mut df = 1.0;
        let mut f_low = 0.0;
        let mut f_high = 1.0;
        let mut n_samples = 9;

        let mut best = WlsEstimate {
            params: op * log_signal(sig.as_slice(), min_signal),
            f: 0.,
        };

        let mut tissue = DVector::zeros(n);
        for _ in 0..self.config.grid_iterations {
            df *= 0.1;
            let mut best_err = f64::INFINITY;
            for f in linspace(f_low + df, f_high - df, n_samples) {
                for i in 0..n {
                    // the free water part can exceed the measured signal for too large f
                    let sa = sig[i] - f * s0 * self.fw_decay[i];
                    let sa = if sa <= 0. { min_signal } else { sa };
                    tissue[i] = (sa / (1. - f)).ln();
                }
                let params = op * &tissue;
                let err = (0..n)
                    .map(|i| {
                        let pred = (1. - f) * (self.design.row(i) * &params)[0].exp() + f * s0 * self.fw_decay[i];
                        (sig[i] - pred).powi(2)
                    })
                    .sum::<f64>();
                if err < best_err {
                    best_err = err;
                    best = WlsEstimate { params, f };
                }
            }
            f_low = best.f - df;
            f_high = best.f + df;
            n_samples = 19;
        }
        best
    }

    /// Levenberg-Marquardt refinement of D, S0 and f. Returns None when the optimizer does not converge.
    fn refine(&self, sig: &DVector<f64>, s0: f64, init: &WlsEstimate) -> Option<FreeWaterFitResult> {
        let tensor = DiffusionTensor::new([
            init.params[0], init.params[1], init.params[2],
            init.params[3], init.params[4], init.params[5],
        ]);
        let t = if self.config.cholesky {
            tensor.to_cholesky()
        } else {
            *tensor.coefficients()
        };
        let f_param = if self.config.f_transform {
            (1. - 2. * init.f).clamp(-1., 1.).acos()
        } else {
            init.f
        };
        let start = OVector::<f64, U8>::from_column_slice(&[t[0], t[1], t[2], t[3], t[4], t[5], s0.ln(), f_param]);

        let problem = FreeWaterProblem {
            design: &self.design,
            signal: sig,
            fw_decay: &self.fw_decay,
            cholesky: self.config.cholesky,
            f_transform: self.config.f_transform,
            params: start,
        };

        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(self.config.patience)
            .minimize(problem);

        let converged = report.termination.was_successful()
            || matches!(report.termination, TerminationReason::NoImprovementPossible(_));
        if !converged {
            return None;
        }

        let p = &problem.params;
        let tensor = DiffusionTensor::new(problem.coefficients());
        let (f, _) = problem.fraction();
        let s0 = p[6].exp();
        if !(tensor.is_finite() && f.is_finite() && s0.is_finite()) {
            return None;
        }
        Some(FreeWaterFitResult {
            tensor,
            f: f.clamp(0., 1.),
            s0,
            status: FitStatus::Fitted,
        })
    }
}

fn result_from_params(params: &DVector<f64>, f: f64) -> FreeWaterFitResult {
    let fit = DtiFit::from_params(params);
    FreeWaterFitResult {
        tensor: fit.tensor,
        f: f.clamp(0., 1.),
        s0: fit.s0,
        status: fit.status,
    }
}

/// exp(-b g^T D g) for measurement i
fn tissue_decay(design: &DMatrix<f64>, i: usize, d: &[f64; 6]) -> f64 {
    (0..6).map(|k| design[(i, k)] * d[k]).sum::<f64>().exp()
}

/// n evenly spaced values from start to stop (inclusive)
fn linspace(start: f64, stop: f64, n: usize) -> impl Iterator<Item = f64> {
    let step = if n > 1 { (stop - start) / (n - 1) as f64 } else { 0. };
    (0..n).map(move |i| start + step * i as f64)
}

/// Nonlinear least squares problem over [d0..d5, ln(S0), f or phi]. d are the tensor coefficients
/// or their Cholesky factor entries.
struct FreeWaterProblem<'a> {
    design: &'a DMatrix<f64>,
    signal: &'a DVector<f64>,
    fw_decay: &'a DVector<f64>,
    cholesky: bool,
    f_transform: bool,
    params: OVector<f64, U8>,
}

impl FreeWaterProblem<'_> {
    fn raw_tensor_params(&self) -> [f64; 6] {
        let p = &self.params;
        [p[0], p[1], p[2], p[3], p[4], p[5]]
    }

    fn coefficients(&self) -> [f64; 6] {
        let t = self.raw_tensor_params();
        if self.cholesky {
            cholesky_to_coefficients(&t)
        } else {
            t
        }
    }

    /// free water fraction and its derivative w.r.t. the last parameter
    fn fraction(&self) -> (f64, f64) {
        let x = self.params[7];
        if self.f_transform {
            (0.5 * (1. - x.cos()), 0.5 * x.sin())
        } else {
            (x, 1.)
        }
    }
}

impl LeastSquaresProblem<f64, Dyn, U8> for FreeWaterProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U8>;
    type ParameterStorage = Owned<f64, U8>;

    fn set_params(&mut self, x: &OVector<f64, U8>) {
        self.params.copy_from(x);
    }

    fn params(&self) -> OVector<f64, U8> {
        self.params
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let d = self.coefficients();
        let (f, _) = self.fraction();
        let s0 = self.params[6].exp();
        let r = DVector::from_iterator(
            self.signal.len(),
            (0..self.signal.len()).map(|i| {
                let e = tissue_decay(self.design, i, &d);
                self.signal[i] - s0 * ((1. - f) * e + f * self.fw_decay[i])
            }),
        );
        r.iter().all(|x| x.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U8>> {
        let d = self.coefficients();
        let (f, df) = self.fraction();
        let s0 = self.params[6].exp();
        let chol_jac = self.cholesky.then(|| cholesky_jacobian(&self.raw_tensor_params()));

        let n = self.signal.len();
        let mut jac = OMatrix::<f64, Dyn, U8>::zeros_generic(Dyn(n), Const::<8>);
        for i in 0..n {
            let e = tissue_decay(self.design, i, &d);
            let w = self.fw_decay[i];
            // derivative of the prediction w.r.t. the tensor coefficients
            let mut dy_dd = [0f64; 6];
            for (k, v) in dy_dd.iter_mut().enumerate() {
                *v = s0 * (1. - f) * e * self.design[(i, k)];
            }
            match &chol_jac {
                Some(cj) => {
                    for j in 0..6 {
                        jac[(i, j)] = -(0..6).map(|k| dy_dd[k] * cj[k][j]).sum::<f64>();
                    }
                }
                None => {
                    for j in 0..6 {
                        jac[(i, j)] = -dy_dd[j];
                    }
                }
            }
            jac[(i, 6)] = -s0 * ((1. - f) * e + f * w);
            jac[(i, 7)] = -s0 * (w - e) * df;
        }
        jac.iter().all(|x| x.is_finite()).then_some(jac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dti::{DtiFitMethod, TensorModel};
    use crate::phantom::{add_rician_noise, multi_shell_scheme, synthesize_signal};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const SHELLS: [f64; 5] = [0., 200., 400., 1000., 2000.];

    fn scheme() -> AcquisitionScheme {
        multi_shell_scheme(&SHELLS, 32, 6).unwrap()
    }

    fn truth() -> DiffusionTensor {
        DiffusionTensor::from_principal_direction(&[0.3, -0.5, 0.8], [1.6e-3, 0.5e-3, 0.3e-3])
    }

    fn config(fit_method: FitMethod, cholesky: bool) -> FreeWaterConfig {
        FreeWaterConfig {
            fit_method,
            cholesky,
            ..Default::default()
        }
    }

    #[test]
    fn recovers_free_water_fraction_from_noise_free_shells() {
        let scheme = scheme();
        let truth = truth();
        let signal = synthesize_signal(&scheme, &truth, 0.3, 1.0, 3e-3);
        let true_fa = TensorScalars::from_tensor(&truth).fa;

        for (method, cholesky) in [(FitMethod::Wls, false), (FitMethod::Nls, false), (FitMethod::Nls, true)] {
            let est = FreeWaterTensorEstimator::new(&scheme, config(method, cholesky), 20.).unwrap();
            let fit = est.fit_signal(&signal);
            assert_eq!(fit.status, FitStatus::Fitted, "{:?} cholesky={}", method, cholesky);
            assert!((fit.f - 0.3).abs() < 0.01, "f = {} for {:?}", fit.f, method);
            assert!((fit.fa() - true_fa).abs() / true_fa < 0.01, "fa = {} vs {}", fit.fa(), true_fa);
            assert_relative_eq!(fit.s0, 1.0, max_relative = 0.01);
        }
    }

    #[test]
    fn zero_free_water_degenerates_to_standard_dti() {
        let scheme = scheme();
        let truth = truth();
        let signal = synthesize_signal(&scheme, &truth, 0., 500., 3e-3);

        let dti = TensorModel::new(&scheme, DtiFitMethod::Wls, 1e-6).unwrap().fit_signal(&signal);
        let est = FreeWaterTensorEstimator::new(&scheme, FreeWaterConfig::default(), 20.).unwrap();
        let fit = est.fit_signal(&signal);

        assert_eq!(fit.status, FitStatus::Fitted);
        assert!(fit.f < 5e-3, "f = {}", fit.f);
        assert_relative_eq!(fit.s0, dti.s0, max_relative = 1e-3);
        for (a, b) in fit.tensor.coefficients().iter().zip(dti.tensor.coefficients()) {
            assert!((a - b).abs() < 2e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn single_shell_scheme_is_rejected_up_front() {
        let scheme = multi_shell_scheme(&[0., 1000.], 64, 4).unwrap();
        let r = FreeWaterTensorEstimator::new(&scheme, FreeWaterConfig::default(), 20.);
        assert!(matches!(r, Err(FwdtiError::Configuration(_))));
    }

    #[test]
    fn pure_free_water_is_flagged() {
        let scheme = scheme();
        let signal = synthesize_signal(&scheme, &truth(), 1.0, 1.0, 3e-3);
        let est = FreeWaterTensorEstimator::new(&scheme, FreeWaterConfig::default(), 20.).unwrap();
        let fit = est.fit_signal(&signal);
        assert_eq!(fit.status, FitStatus::FreeWaterDominated);
        assert_eq!(fit.f, 1.);
        assert_eq!(fit.fa(), 0.);
    }

    #[test]
    fn invalid_samples_are_skipped() {
        let scheme = scheme();
        let est = FreeWaterTensorEstimator::new(&scheme, FreeWaterConfig::default(), 20.).unwrap();
        let mut signal = synthesize_signal(&scheme, &truth(), 0.2, 1.0, 3e-3);
        signal[10] = -1.;
        let fit = est.fit_signal(&signal);
        assert_eq!(fit, FreeWaterFitResult::with_status(FitStatus::InvalidSignal));
        signal[10] = f64::INFINITY;
        assert_eq!(est.fit_signal(&signal).status, FitStatus::InvalidSignal);
    }

    #[test]
    fn noisy_fractions_stay_in_unit_interval() {
        let scheme = scheme();
        let mut rng = StdRng::seed_from_u64(7);
        for cholesky in [false, true] {
            let mut cfg = config(FitMethod::Nls, cholesky);
            cfg.f_transform = false;
            let est = FreeWaterTensorEstimator::new(&scheme, cfg, 20.).unwrap();
            for f_true in [0., 0.05, 0.5, 0.9] {
                let mut signal = synthesize_signal(&scheme, &truth(), f_true, 100., 3e-3);
                add_rician_noise(&mut signal, 8., &mut rng);
                let fit = est.fit_signal(&signal);
                assert!((0. ..=1.).contains(&fit.f), "f = {}", fit.f);
            }
        }
    }

    #[test]
    fn unconverged_refinement_falls_back_to_naive_tensor() {
        let scheme = scheme();
        let design = scheme.design_matrix();
        let mut rng = StdRng::seed_from_u64(5);
        let mut n_fallback = 0;
        for (cholesky, f_transform) in [(false, false), (false, true), (true, false), (true, true)] {
            let cfg = FreeWaterConfig {
                patience: 1,
                f_transform,
                ..config(FitMethod::Nls, cholesky)
            };
            let est = FreeWaterTensorEstimator::new(&scheme, cfg, 20.).unwrap();
            for _ in 0..10 {
                let mut signal = synthesize_signal(&scheme, &truth(), 0.3, 100., 3e-3);
                add_rician_noise(&mut signal, 10., &mut rng);
                let fit = est.fit_signal(&signal);
                if fit.status != FitStatus::NotConverged {
                    continue;
                }
                n_fallback += 1;
                // single compartment fit weighted by the measured signal squared
                let weights = DVector::from_iterator(signal.len(), signal.iter().map(|s| s * s));
                let op = weighted_solve(&design, &weights).unwrap();
                let naive = DtiFit::from_params(&(&op * log_signal(&signal, 1e-6)));
                assert_eq!(fit.f, 0.);
                assert_eq!(fit.tensor, naive.tensor);
                assert_eq!(fit.s0, naive.s0);
            }
        }
        assert!(n_fallback > 0);
    }

    #[test]
    fn repeated_fits_are_identical() {
        let scheme = scheme();
        let mut rng = StdRng::seed_from_u64(11);
        let mut signal = synthesize_signal(&scheme, &truth(), 0.25, 100., 3e-3);
        add_rician_noise(&mut signal, 3., &mut rng);
        let est = FreeWaterTensorEstimator::new(&scheme, FreeWaterConfig::default(), 20.).unwrap();
        assert_eq!(est.fit_signal(&signal), est.fit_signal(&signal));
    }

    #[test]
    fn prediction_matches_synthesis() {
        let scheme = scheme();
        let est = FreeWaterTensorEstimator::new(&scheme, FreeWaterConfig::default(), 20.).unwrap();
        let fit = FreeWaterFitResult {
            tensor: truth(),
            f: 0.4,
            s0: 2.,
            status: FitStatus::Fitted,
        };
        let signal = synthesize_signal(&scheme, &truth(), 0.4, 2., 3e-3);
        for (p, s) in est.predict(&fit).iter().zip(&signal) {
            assert_relative_eq!(p, s, max_relative = 1e-12);
        }
    }

    #[test]
    fn analytic_jacobian_matches_numeric() {
        let scheme = scheme();
        let design = scheme.design_matrix();
        let fw_decay = DVector::from_iterator(scheme.len(), scheme.bvals().iter().map(|b| (-b * 3e-3).exp()));
        let signal = DVector::from_vec(synthesize_signal(&scheme, &truth(), 0.3, 1.0, 3e-3));
        for cholesky in [false, true] {
            let t = if cholesky { truth().to_cholesky() } else { *truth().coefficients() };
            let params = OVector::<f64, U8>::from_column_slice(&[t[0], t[1], t[2], t[3], t[4], t[5], 0.1, 1.1]);
            let mut problem = FreeWaterProblem {
                design: &design,
                signal: &signal,
                fw_decay: &fw_decay,
                cholesky,
                f_transform: true,
                params,
            };
            let analytic = problem.jacobian().unwrap();
            // central differences
            let h = 1e-7;
            for j in 0..8 {
                let mut plus = params;
                plus[j] += h;
                problem.set_params(&plus);
                let r_plus = problem.residuals().unwrap();
                let mut minus = params;
                minus[j] -= h;
                problem.set_params(&minus);
                let r_minus = problem.residuals().unwrap();
                for i in 0..signal.len() {
                    let numeric = (r_plus[i] - r_minus[i]) / (2. * h);
                    let a = analytic[(i, j)];
                    assert!((a - numeric).abs() <= 1e-4 * (1. + numeric.abs()), "d r{} / d p{}: {} vs {}", i, j, a, numeric);
                }
            }
        }
    }
}
