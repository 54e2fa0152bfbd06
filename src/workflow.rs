// End to end processing of a data set: load, validate, fit both models, write maps and a report

use crate::acquisition::AcquisitionScheme;
use crate::cfl_io::{read_array3, read_array4, read_volume_series, write_cfl};
use crate::dti::{FitStatus, TensorModel};
use crate::error::{FwdtiError, Result};
use crate::fwdti::FreeWaterTensorEstimator;
use crate::metrics::TensorScalars;
use crate::tensor::DiffusionTensor;
use crate::volume::{abs_difference, fit_dti, fit_free_water, SampleMask};
use crate::{DataSetParams, FwdtiParams};
use clap::Parser;
use log::{info, warn};
use ndarray::{Array3, Array4, Axis, ShapeBuilder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Summary written to report.json after a fit
#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub dims: [usize; 3],
    pub n_measurements: usize,
    pub n_b0: usize,
    pub shells: Vec<f64>,
    pub n_voxels_fitted: usize,
    pub free_water_status: BTreeMap<FitStatus, usize>,
    pub dti_status: BTreeMap<FitStatus, usize>,
    pub free_water_elapsed_secs: f64,
    pub dti_elapsed_secs: f64,
    pub timed_out: bool,
    /// mean free water fraction over converged voxels
    pub mean_f: f64,
    pub params: FwdtiParams,
}

fn load_data(ds: &DataSetParams) -> Result<Array4<f32>> {
    match (&ds.data, &ds.volumes) {
        (Some(data), _) => {
            info!("loading {} ...", data.display());
            read_array4(data)
        }
        (None, Some(pattern)) => {
            info!("loading volumes matching {} ...", pattern);
            read_volume_series(pattern)
        }
        (None, None) => Err(FwdtiError::config("either a 4-D data image or a volume pattern is required")),
    }
}

fn load_mask(mask: Option<&Path>, dims: [usize; 3]) -> Result<SampleMask> {
    let Some(mask) = mask else {
        return Ok(SampleMask::full(dims));
    };
    info!("loading sample mask {} ...", mask.display());
    let m = read_array3(mask)?;
    let mask_dims: [usize; 3] = m.dim().into();
    if mask_dims != dims {
        return Err(FwdtiError::Shape(format!(
            "mask dims {:?} do not match data dims {:?}",
            mask_dims, dims
        )));
    }
    // column-major
    let values = m.t().iter().copied().collect::<Vec<f32>>();
    SampleMask::from_values(dims, &values)
}

fn timeout(params: &FwdtiParams) -> Result<Option<Duration>> {
    params
        .timeout_secs
        .map(|t| Duration::try_from_secs_f64(t).map_err(|e| FwdtiError::config(format!("invalid timeout {}: {}", t, e))))
        .transpose()
}

fn write_map(output_dir: &Path, name: &str, map: &Array3<f32>) -> Result<()> {
    write_cfl(output_dir.join(name), map)
}

/// Runs the free water elimination fit and a standard tensor fit on a data set and writes all
/// output maps and report.json to the output directory.
pub fn fwdti_exec(ds: &DataSetParams, params: &FwdtiParams) -> Result<FitReport> {
    let acquired = AcquisitionScheme::from_fsl_files(&ds.bvals, &ds.bvecs, params.b0_threshold)?;
    let selected = params
        .max_bval
        .map(|b| acquired.measurements_up_to(b, params.shell_tolerance));
    let scheme = match &selected {
        Some(keep) => {
            info!("keeping {} of {} measurements with b <= {:?}", keep.len(), acquired.len(), params.max_bval);
            acquired.subset(keep)?
        }
        None => acquired.clone(),
    };
    let shells = scheme.shells(params.shell_tolerance);
    info!(
        "acquisition has {} measurements ({} b0) on shells {:?}",
        scheme.len(),
        scheme.n_b0(),
        shells
    );

    // configuration problems are reported before any data is read
    let estimator = FreeWaterTensorEstimator::new(&scheme, params.free_water.clone(), params.shell_tolerance)?;
    let dti_model = TensorModel::new(&scheme, params.dti_method, params.free_water.min_signal)?;
    let timeout = timeout(params)?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(params.n_threads.unwrap_or(0))
        .build()
        .map_err(|e| FwdtiError::config(format!("failed to build thread pool: {}", e)))?;

    let mut data = load_data(ds)?;
    if data.dim().3 != acquired.len() {
        return Err(FwdtiError::Shape(format!(
            "data has {} volumes but the acquisition scheme has {} measurements",
            data.dim().3,
            acquired.len()
        )));
    }
    if let Some(keep) = &selected {
        data = data.select(Axis(3), keep);
    }
    let [nx, ny, nz, nq]: [usize; 4] = data.dim().into();
    info!("data set has dims {:?}", [nx, ny, nz, nq]);

    let mut mask = load_mask(ds.mask.as_deref(), [nx, ny, nz])?;
    if let Some(z) = ds.axial_slice {
        info!("restricting fit to axial slice {}", z);
        mask.restrict_to_axial_slice(z)?;
    }
    info!("fitting {} of {} voxels on {} threads ...", mask.count(), nx * ny * nz, pool.current_num_threads());

    let fw = pool.install(|| fit_free_water(&estimator, &data, &mask, timeout))?;
    info!("free water fit finished in {:.03} secs", fw.elapsed().as_secs_f32());
    let dti = pool.install(|| fit_dti(&dti_model, &data, &mask))?;
    info!("tensor fit finished in {:.03} secs", dti.elapsed().as_secs_f32());

    let fw_status = fw.status_counts();
    if fw.timed_out() {
        warn!("time limit reached, remaining voxels are marked as not converged");
    }
    if let Some(n) = fw_status.get(&FitStatus::NotConverged) {
        warn!("{} voxels did not converge", n);
    }
    if let Some(n) = fw_status.get(&FitStatus::InvalidSignal) {
        warn!("{} voxels have invalid signal", n);
    }

    let output_dir = ds.output_dir.as_path();
    fs::create_dir_all(output_dir).map_err(|e| FwdtiError::io(output_dir, e))?;
    info!("writing maps to {} ...", output_dir.display());

    let fw_fa = fw.fa_map();
    let fw_md = fw.md_map();
    let dti_fa = dti.fa_map();
    let dti_md = dti.md_map();
    write_map(output_dir, "fw_fa", &fw_fa)?;
    write_map(output_dir, "fw_md", &fw_md)?;
    write_map(output_dir, "fw_ad", &fw.ad_map())?;
    write_map(output_dir, "fw_rd", &fw.rd_map())?;
    write_map(output_dir, "fw_f", &fw.f_map())?;
    write_map(output_dir, "fw_s0", &fw.s0_map())?;
    write_map(output_dir, "fw_status", &fw.status_map())?;
    write_cfl(output_dir.join("fw_tensor"), &fw.tensor_map())?;
    write_map(output_dir, "dti_fa", &dti_fa)?;
    write_map(output_dir, "dti_md", &dti_md)?;
    write_cfl(output_dir.join("dti_tensor"), &dti.tensor_map())?;
    write_map(output_dir, "fa_diff", &abs_difference(&fw_fa, &dti_fa))?;
    write_map(output_dir, "md_diff", &abs_difference(&fw_md, &dti_md))?;

    let converged = fw
        .results()
        .iter()
        .filter(|r| matches!(r.status, FitStatus::Fitted | FitStatus::FreeWaterDominated))
        .map(|r| r.f)
        .collect::<Vec<_>>();
    let mean_f = if converged.is_empty() {
        0.
    } else {
        converged.iter().sum::<f64>() / converged.len() as f64
    };

    let report = FitReport {
        dims: [nx, ny, nz],
        n_measurements: nq,
        n_b0: scheme.n_b0(),
        shells,
        n_voxels_fitted: mask.count(),
        free_water_status: fw_status,
        dti_status: dti.status_counts(),
        free_water_elapsed_secs: fw.elapsed().as_secs_f64(),
        dti_elapsed_secs: dti.elapsed().as_secs_f64(),
        timed_out: fw.timed_out(),
        mean_f,
        params: params.clone(),
    };
    let report_file = output_dir.join("report.json");
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| FwdtiError::Parse { path: report_file.clone(), reason: e.to_string() })?;
    fs::write(&report_file, json).map_err(|e| FwdtiError::io(&report_file, e))?;
    info!("wrote fit report to {}", report_file.display());

    Ok(report)
}

#[derive(Debug, Clone, Parser)]
pub struct CalcScalarsArgs {
    /// 4-D cfl tensor image (nx, ny, nz, 6) with coefficients {Dxx Dyy Dzz Dxy Dxz Dyz}
    pub tensor: PathBuf,
    /// output base name. Maps are written to <prefix>_fa, <prefix>_md, <prefix>_ad and <prefix>_rd
    pub output_prefix: PathBuf,
}

/// scalar maps (fa, md, ad, rd) of a tensor image
pub fn tensor_scalar_maps(tensor: &Array4<f32>) -> Result<[Array3<f32>; 4]> {
    let [nx, ny, nz, nc]: [usize; 4] = tensor.dim().into();
    if nc != 6 {
        return Err(FwdtiError::Shape(format!("tensor image must have 6 coefficients, found {}", nc)));
    }
    let scalars = tensor
        .lanes(Axis(3))
        .into_iter()
        .map(|c| {
            let coefficients = [c[0], c[1], c[2], c[3], c[4], c[5]].map(f64::from);
            TensorScalars::from_tensor(&DiffusionTensor::new(coefficients))
        })
        .collect::<Vec<_>>();
    // lanes are visited in logical (row-major) order of the remaining axes
    let map = |value: fn(&TensorScalars) -> f64| {
        Array3::from_shape_fn((nx, ny, nz).f(), |(x, y, z)| value(&scalars[(x * ny + y) * nz + z]) as f32)
    };
    Ok([map(|s| s.fa), map(|s| s.md), map(|s| s.ad), map(|s| s.rd)])
}

pub fn calc_scalars(args: &CalcScalarsArgs) -> Result<()> {
    info!("loading tensor image {} ...", args.tensor.display());
    let tensor = read_array4(&args.tensor)?;
    let maps = tensor_scalar_maps(&tensor)?;
    for (name, map) in ["fa", "md", "ad", "rd"].iter().zip(&maps) {
        let mut out = args.output_prefix.as_os_str().to_owned();
        out.push(format!("_{}", name));
        let out = PathBuf::from(out);
        write_cfl(&out, map)?;
        info!("wrote {}", out.display());
    }
    Ok(())
}
