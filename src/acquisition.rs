// Gradient table handling: b-values, b-vectors, shells and the log-linear design matrix

use crate::error::{FwdtiError, Result};
use nalgebra::DMatrix;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// number of columns of the log-linear design matrix: 6 unique tensor entries + ln(S0)
pub const N_DESIGN_COLS: usize = 7;

/// the minimum number of diffusion-weighted measurements needed to pin down 6 tensor entries
const MIN_WEIGHTED_MEASUREMENTS: usize = 6;

/// An ordered set of (gradient direction, b-value) pairs, one per measured volume.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionScheme {
    bvals: Vec<f64>,
    bvecs: Vec<[f64; 3]>,
    b0_mask: Vec<bool>,
    b0_threshold: f64,
}

impl AcquisitionScheme {
    /// Builds a scheme from b-values and gradient directions. Measurements with b <= b0_threshold are
    /// treated as b0 references. Directions of weighted measurements are normalized to unit length.
    pub fn new(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>, b0_threshold: f64) -> Result<Self> {
        if bvals.len() != bvecs.len() {
            return Err(FwdtiError::config(format!(
                "found {} b-values but {} b-vectors",
                bvals.len(),
                bvecs.len()
            )));
        }
        if !(b0_threshold >= 0. && b0_threshold.is_finite()) {
            return Err(FwdtiError::config("b0 threshold must be finite and non-negative"));
        }
        if let Some(b) = bvals.iter().find(|b| !b.is_finite() || **b < 0.) {
            return Err(FwdtiError::config(format!("invalid b-value {b}")));
        }

        let b0_mask = bvals.iter().map(|&b| b <= b0_threshold).collect::<Vec<bool>>();
        if !b0_mask.iter().any(|&m| m) {
            return Err(FwdtiError::config(format!(
                "no b0 measurement found (b <= {b0_threshold})"
            )));
        }

        let mut normalized = Vec::with_capacity(bvecs.len());
        for (g, &is_b0) in bvecs.iter().zip(&b0_mask) {
            let norm = (g[0].powi(2) + g[1].powi(2) + g[2].powi(2)).sqrt();
            if is_b0 {
                normalized.push(*g);
            } else if norm > f64::EPSILON && norm.is_finite() {
                normalized.push([g[0] / norm, g[1] / norm, g[2] / norm]);
            } else {
                return Err(FwdtiError::config(format!(
                    "diffusion weighted measurement has a null gradient direction {:?}",
                    g
                )));
            }
        }

        Ok(Self {
            bvals,
            bvecs: normalized,
            b0_mask,
            b0_threshold,
        })
    }

    /// loads an FSL-style pair of bvals / bvecs text files
    pub fn from_fsl_files(bvals: impl AsRef<Path>, bvecs: impl AsRef<Path>, b0_threshold: f64) -> Result<Self> {
        let b = read_bvals(bvals)?;
        let g = read_bvecs(bvecs)?;
        Self::new(b, g, b0_threshold)
    }

    /// writes the scheme as FSL-style bvals (one row) and bvecs (three rows) text files
    pub fn write_fsl_files(&self, bvals: impl AsRef<Path>, bvecs: impl AsRef<Path>) -> Result<()> {
        let b = format!("{}\n", join_values(self.bvals.iter().copied()));
        let g = (0..3)
            .map(|c| format!("{}\n", join_values(self.bvecs.iter().map(|v| v[c]))))
            .collect::<String>();
        let (bvals, bvecs) = (bvals.as_ref(), bvecs.as_ref());
        std::fs::write(bvals, b).map_err(|e| FwdtiError::io(bvals, e))?;
        std::fs::write(bvecs, g).map_err(|e| FwdtiError::io(bvecs, e))
    }

    /// indices of the measurements whose b-value is at most `max_bval` (within `tolerance`)
    pub fn measurements_up_to(&self, max_bval: f64, tolerance: f64) -> Vec<usize> {
        self.bvals
            .iter()
            .enumerate()
            .filter(|(_, &b)| b <= max_bval + tolerance)
            .map(|(i, _)| i)
            .collect()
    }

    /// a new scheme made of the measurements at `indices`, in that order
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&i) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(FwdtiError::config(format!(
                "measurement {} is out of range for {} measurements",
                i,
                self.len()
            )));
        }
        Self::new(
            indices.iter().map(|&i| self.bvals[i]).collect(),
            indices.iter().map(|&i| self.bvecs[i]).collect(),
            self.b0_threshold,
        )
    }

    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }

    pub fn bvals(&self) -> &[f64] {
        &self.bvals
    }

    pub fn bvecs(&self) -> &[[f64; 3]] {
        &self.bvecs
    }

    pub fn b0_threshold(&self) -> f64 {
        self.b0_threshold
    }

    /// true entries mark b0 reference measurements
    pub fn b0_mask(&self) -> &[bool] {
        &self.b0_mask
    }

    pub fn n_b0(&self) -> usize {
        self.b0_mask.iter().filter(|&&m| m).count()
    }

    pub fn n_weighted(&self) -> usize {
        self.len() - self.n_b0()
    }

    /// Distinct non-zero b-values in ascending order. Two b-values belong to the same shell when
    /// they are within `tolerance` of the shell's first member.
    pub fn shells(&self, tolerance: f64) -> Vec<f64> {
        let mut weighted = self
            .bvals
            .iter()
            .zip(&self.b0_mask)
            .filter(|(_, &m)| !m)
            .map(|(&b, _)| b)
            .collect::<Vec<f64>>();
        weighted.sort_by(|a, b| a.total_cmp(b));
        let mut shells: Vec<f64> = vec![];
        for b in weighted {
            match shells.last() {
                Some(&s) if (b - s).abs() <= tolerance => {}
                _ => shells.push(b),
            }
        }
        shells
    }

    /// Checks that the two-compartment model can be identified from this scheme: at least two
    /// distinct non-zero shells and enough weighted measurements for a full tensor.
    pub fn check_free_water_identifiable(&self, shell_tolerance: f64) -> Result<()> {
        let shells = self.shells(shell_tolerance);
        if shells.len() < 2 {
            return Err(FwdtiError::config(format!(
                "underdetermined model: free water elimination needs at least 2 distinct non-zero b-values, found {:?}",
                shells
            )));
        }
        self.check_tensor_identifiable()
    }

    /// checks for enough diffusion weighted measurements to estimate a tensor
    pub fn check_tensor_identifiable(&self) -> Result<()> {
        if self.n_weighted() < MIN_WEIGHTED_MEASUREMENTS {
            return Err(FwdtiError::config(format!(
                "underdetermined model: a tensor needs at least {} diffusion weighted measurements, found {}",
                MIN_WEIGHTED_MEASUREMENTS,
                self.n_weighted()
            )));
        }
        Ok(())
    }

    /// Log-linear design matrix A (one row per measurement) such that ln(S) = A * [Dxx Dyy Dzz Dxy Dxz Dyz ln(S0)].
    /// Rows are {-b gx^2, -b gy^2, -b gz^2, -2b gx gy, -2b gx gz, -2b gy gz, 1}
    pub fn design_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.len(), N_DESIGN_COLS, |row, col| {
            let b = self.bvals[row];
            let g = &self.bvecs[row];
            match col {
                0..=2 => -b * g[col].powi(2),
                3 => -2.0 * b * g[0] * g[1],
                4 => -2.0 * b * g[0] * g[2],
                5 => -2.0 * b * g[1] * g[2],
                _ => 1.0,
            }
        })
    }

    /// the mean of the b0 entries of a signal
    pub fn mean_b0(&self, signal: &[f64]) -> f64 {
        let (sum, n) = signal
            .iter()
            .zip(&self.b0_mask)
            .filter(|(_, &m)| m)
            .fold((0., 0usize), |(s, n), (&x, _)| (s + x, n + 1));
        sum / n as f64
    }
}

fn join_values(values: impl Iterator<Item = f64>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

fn read_to_string(path: &Path) -> Result<String> {
    let mut s = String::new();
    let mut f = File::open(path).map_err(|e| FwdtiError::io(path, e))?;
    f.read_to_string(&mut s).map_err(|e| FwdtiError::io(path, e))?;
    Ok(s)
}

fn parse_values(path: &Path, text: &str) -> Result<Vec<f64>> {
    text.split_ascii_whitespace()
        .map(|s| {
            s.parse::<f64>().map_err(|e| FwdtiError::Parse {
                path: path.to_path_buf(),
                reason: format!("'{s}': {e}"),
            })
        })
        .collect()
}

/// read b-values from a text file with whitespace delimiter
pub fn read_bvals(txt_file: impl AsRef<Path>) -> Result<Vec<f64>> {
    let path = txt_file.as_ref();
    let s = read_to_string(path)?;
    parse_values(path, &s)
}

/// Read vectors from a text file with whitespace delimiter. Both the FSL layout (3 rows of n
/// components) and one vector per line are accepted.
pub fn read_bvecs(txt_file: impl AsRef<Path>) -> Result<Vec<[f64; 3]>> {
    let path = txt_file.as_ref();
    let s = read_to_string(path)?;
    let rows = s
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| parse_values(path, l))
        .collect::<Result<Vec<_>>>()?;

    let fsl_layout = rows.len() == 3 && rows.iter().all(|r| r.len() == rows[0].len());
    if fsl_layout {
        let n = rows[0].len();
        return Ok((0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect());
    }

    rows.iter()
        .map(|r| match r.as_slice() {
            [x, y, z] => Ok([*x, *y, *z]),
            _ => Err(FwdtiError::Parse {
                path: path.to_path_buf(),
                reason: format!("expected 3 components per vector, found {}", r.len()),
            }),
        })
        .collect()
}
