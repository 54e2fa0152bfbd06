// Voxel-wise model fitting over 4-D column-major data sets (nx, ny, nz, nq)

use crate::dti::{DtiFit, FitStatus, TensorModel};
use crate::error::{FwdtiError, Result};
use crate::fwdti::{FreeWaterFitResult, FreeWaterTensorEstimator};
use crate::metrics::TensorScalars;
use crate::tensor::DiffusionTensor;
use ndarray::{Array3, Array4, ShapeBuilder};
use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[inline(always)]
pub fn index_to_subscript_col_maj3(index: usize, size: &[usize; 3]) -> [usize; 3] {
    let iz = index / (size[0] * size[1]);
    let rem = index % (size[0] * size[1]);
    [rem % size[0], rem / size[0], iz]
}

/// Boolean voxel mask stored in column-major order
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMask {
    dims: [usize; 3],
    inside: Vec<bool>,
}

impl SampleMask {
    pub fn full(dims: [usize; 3]) -> Self {
        Self {
            dims,
            inside: vec![true; dims.iter().product()],
        }
    }

    /// every non-zero value is inside the mask
    pub fn from_values(dims: [usize; 3], values: &[f32]) -> Result<Self> {
        let n: usize = dims.iter().product();
        if values.len() != n {
            return Err(FwdtiError::Shape(format!(
                "mask has {} entries, expected {} for dims {:?}",
                values.len(),
                n,
                dims
            )));
        }
        Ok(Self {
            dims,
            inside: values.iter().map(|&v| v != 0.).collect(),
        })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// false for voxels outside the mask and for indices past the end of the volume
    pub fn contains(&self, index: usize) -> bool {
        self.inside.get(index).copied().unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.inside.iter().filter(|&&m| m).count()
    }

    /// keeps only voxels of the axial slice z
    pub fn restrict_to_axial_slice(&mut self, z: usize) -> Result<()> {
        if z >= self.dims[2] {
            return Err(FwdtiError::Shape(format!(
                "axial slice {} is out of range for {} slices",
                z, self.dims[2]
            )));
        }
        let dims = self.dims;
        self.inside.iter_mut().enumerate().for_each(|(i, m)| {
            *m &= index_to_subscript_col_maj3(i, &dims)[2] == z;
        });
        Ok(())
    }
}

/// Common view of a per-voxel fit used for map extraction
pub trait VoxelFit: Copy + Send + Sync {
    fn with_status(status: FitStatus) -> Self;
    fn tensor(&self) -> &DiffusionTensor;
    fn s0(&self) -> f64;
    fn status(&self) -> FitStatus;
}

impl VoxelFit for DtiFit {
    fn with_status(status: FitStatus) -> Self {
        DtiFit::with_status(status)
    }

    fn tensor(&self) -> &DiffusionTensor {
        &self.tensor
    }

    fn s0(&self) -> f64 {
        self.s0
    }

    fn status(&self) -> FitStatus {
        self.status
    }
}

impl VoxelFit for FreeWaterFitResult {
    fn with_status(status: FitStatus) -> Self {
        FreeWaterFitResult::with_status(status)
    }

    fn tensor(&self) -> &DiffusionTensor {
        &self.tensor
    }

    fn s0(&self) -> f64 {
        self.s0
    }

    fn status(&self) -> FitStatus {
        self.status
    }
}

/// Per-voxel fit results of a whole volume, in column-major voxel order
#[derive(Debug, Clone)]
pub struct FitMaps<T: VoxelFit> {
    dims: [usize; 3],
    results: Vec<T>,
    elapsed: Duration,
    timed_out: bool,
}

pub type FreeWaterFitMaps = FitMaps<FreeWaterFitResult>;
pub type DtiFitMaps = FitMaps<DtiFit>;

impl<T: VoxelFit> FitMaps<T> {
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn results(&self) -> &[T] {
        &self.results
    }

    /// result of the voxel at `subscript`, None if it lies outside the volume
    pub fn get(&self, subscript: [usize; 3]) -> Option<&T> {
        let [nx, ny, nz] = self.dims;
        let [x, y, z] = subscript;
        if x >= nx || y >= ny || z >= nz {
            return None;
        }
        self.results.get(x + nx * (y + ny * z))
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// true when the global time limit stopped the fit early
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn status_counts(&self) -> BTreeMap<FitStatus, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.results {
            *counts.entry(r.status()).or_insert(0) += 1;
        }
        counts
    }

    /// builds a column-major map from a per-voxel value. Voxels without an estimate are 0
    pub fn map(&self, value: impl Fn(&T) -> f64 + Sync) -> Array3<f32> {
        let values = self
            .results
            .par_iter()
            .map(|r| if r.status().has_estimate() { value(r) as f32 } else { 0. })
            .collect::<Vec<f32>>();
        let [nx, ny, nz] = self.dims;
        Array3::from_shape_fn((nx, ny, nz).f(), |(x, y, z)| values[x + nx * (y + ny * z)])
    }

    fn scalar_map(&self, value: impl Fn(&TensorScalars) -> f64 + Sync) -> Array3<f32> {
        self.map(|r| value(&TensorScalars::from_tensor(r.tensor())))
    }

    pub fn fa_map(&self) -> Array3<f32> {
        self.scalar_map(|s| s.fa)
    }

    pub fn md_map(&self) -> Array3<f32> {
        self.scalar_map(|s| s.md)
    }

    pub fn ad_map(&self) -> Array3<f32> {
        self.scalar_map(|s| s.ad)
    }

    pub fn rd_map(&self) -> Array3<f32> {
        self.scalar_map(|s| s.rd)
    }

    pub fn s0_map(&self) -> Array3<f32> {
        self.map(|r| r.s0())
    }

    /// status codes as floats (see [FitStatus::code])
    pub fn status_map(&self) -> Array3<f32> {
        let [nx, ny, nz] = self.dims;
        Array3::from_shape_fn((nx, ny, nz).f(), |(x, y, z)| {
            self.results[x + nx * (y + ny * z)].status().code() as f32
        })
    }

    /// (nx, ny, nz, 6) tensor coefficients {Dxx Dyy Dzz Dxy Dxz Dyz}
    pub fn tensor_map(&self) -> Array4<f32> {
        let [nx, ny, nz] = self.dims;
        Array4::from_shape_fn((nx, ny, nz, 6).f(), |(x, y, z, c)| {
            let r = &self.results[x + nx * (y + ny * z)];
            if r.status().has_estimate() {
                r.tensor().coefficients()[c] as f32
            } else {
                0.
            }
        })
    }
}

impl FitMaps<FreeWaterFitResult> {
    pub fn f_map(&self) -> Array3<f32> {
        self.map(|r| r.f)
    }
}

/// returns a column-major slice of the data, copying only when the input is laid out differently
fn column_major(data: &Array4<f32>) -> Cow<'_, [f32]> {
    if data.t().is_standard_layout() {
        if let Some(s) = data.as_slice_memory_order() {
            return Cow::Borrowed(s);
        }
    }
    let mut f_order = Array4::<f32>::zeros(data.raw_dim().f());
    f_order.assign(data);
    Cow::Owned(f_order.into_raw_vec())
}

/// Gathers every masked voxel's signal and fits it independently on the rayon pool. Each worker
/// writes only its own output slot. Once `timeout` has elapsed, remaining voxels are marked
/// NotConverged without being fitted.
pub fn fit_voxels<T, F>(data: &Array4<f32>, mask: &SampleMask, timeout: Option<Duration>, fit: F) -> Result<FitMaps<T>>
where
    T: VoxelFit,
    F: Fn(&[f64]) -> T + Sync,
{
    let [nx, ny, nz, nq]: [usize; 4] = data.dim().into();
    if mask.dims() != [nx, ny, nz] {
        return Err(FwdtiError::Shape(format!(
            "mask dims {:?} do not match data dims {:?}",
            mask.dims(),
            [nx, ny, nz]
        )));
    }
    let vol_stride = nx * ny * nz;
    let data = column_major(data);

    let now = Instant::now();
    let mut results = vec![T::with_status(FitStatus::Masked); vol_stride];
    results.par_iter_mut().enumerate().for_each_init(
        || vec![0f64; nq],
        |signal_buff, (i, r)| {
            if !mask.contains(i) {
                return;
            }
            if timeout.is_some_and(|t| now.elapsed() >= t) {
                *r = T::with_status(FitStatus::NotConverged);
                return;
            }
            signal_buff.iter_mut().enumerate().for_each(|(v_idx, s)| {
                *s = data[vol_stride * v_idx + i] as f64;
            });
            *r = fit(signal_buff);
        },
    );
    let elapsed = now.elapsed();
    let timed_out = timeout.is_some_and(|t| elapsed >= t);

    Ok(FitMaps {
        dims: [nx, ny, nz],
        results,
        elapsed,
        timed_out,
    })
}

pub fn fit_free_water(estimator: &FreeWaterTensorEstimator, data: &Array4<f32>, mask: &SampleMask, timeout: Option<Duration>) -> Result<FreeWaterFitMaps> {
    check_measurements(data, estimator.scheme().len())?;
    fit_voxels(data, mask, timeout, |s| estimator.fit_signal(s))
}

pub fn fit_dti(model: &TensorModel, data: &Array4<f32>, mask: &SampleMask) -> Result<DtiFitMaps> {
    check_measurements(data, model.design().nrows())?;
    fit_voxels(data, mask, None, |s| model.fit_signal(s))
}

fn check_measurements(data: &Array4<f32>, n: usize) -> Result<()> {
    let nq = data.dim().3;
    if nq != n {
        return Err(FwdtiError::Shape(format!(
            "data has {} volumes but the acquisition scheme has {} measurements",
            nq, n
        )));
    }
    Ok(())
}

/// voxel-wise |a - b|
pub fn abs_difference(a: &Array3<f32>, b: &Array3<f32>) -> Array3<f32> {
    let mut d = a.clone();
    d.zip_mut_with(b, |x, y| *x = (*x - y).abs());
    d
}
