mod common;

use common::{max_abs_error, phantom_data_set, small_phantom};
use fwdti_reco::acquisition::AcquisitionScheme;
use fwdti_reco::cfl_io::{read_array3, read_array4, write_cfl};
use fwdti_reco::phantom::{generate_phantom, PhantomParams};
use fwdti_reco::{fwdti_exec, FitStatus, FwdtiError, FwdtiParams};
use ndarray::Axis;

#[test]
fn workflow_recovers_phantom_free_water() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = small_phantom();
    let ds = phantom_data_set(&phantom, dir.path());
    let report = fwdti_exec(&ds, &FwdtiParams::default()).unwrap();

    assert_eq!(report.dims, [4, 3, 2]);
    assert_eq!(report.n_measurements, phantom.scheme.len());
    assert_eq!(report.shells, vec![200., 400., 1000., 2000.]);
    assert_eq!(report.n_voxels_fitted, 24);
    assert_eq!(report.free_water_status.values().sum::<usize>(), 24);
    assert!(!report.free_water_status.contains_key(&FitStatus::InvalidSignal));
    assert!(!report.timed_out);

    let out = ds.output_dir.clone();
    for name in [
        "fw_fa", "fw_md", "fw_ad", "fw_rd", "fw_f", "fw_s0", "fw_status", "dti_fa", "dti_md", "fa_diff", "md_diff",
    ] {
        assert_eq!(read_array3(out.join(name)).unwrap().dim(), (4, 3, 2), "{}", name);
    }
    assert_eq!(read_array4(out.join("fw_tensor")).unwrap().dim(), (4, 3, 2, 6));
    assert_eq!(read_array4(out.join("dti_tensor")).unwrap().dim(), (4, 3, 2, 6));

    let fw_f = read_array3(out.join("fw_f")).unwrap();
    let truth_f = read_array3(dir.path().join("truth_f")).unwrap();
    let err = max_abs_error(fw_f.as_slice_memory_order().unwrap(), truth_f.as_slice_memory_order().unwrap());
    assert!(err < 0.01, "max f error {}", err);

    // free water inflates the apparent diffusivity of the single compartment fit
    let fw_md = read_array3(out.join("fw_md")).unwrap();
    let dti_md = read_array3(out.join("dti_md")).unwrap();
    assert!(dti_md[[3, 0, 0]] > fw_md[[3, 0, 0]]);

    let json = std::fs::read_to_string(out.join("report.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["n_voxels_fitted"], 24);
    assert!(value["params"]["free_water"]["isotropic_diffusivity"].is_number());
}

#[test]
fn axial_slice_limits_the_fit() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = small_phantom();
    let mut ds = phantom_data_set(&phantom, dir.path());
    ds.axial_slice = Some(1);
    let report = fwdti_exec(&ds, &FwdtiParams::default()).unwrap();
    assert_eq!(report.n_voxels_fitted, 12);
    assert_eq!(report.free_water_status[&FitStatus::Masked], 12);

    let status = read_array3(ds.output_dir.join("fw_status")).unwrap();
    assert!(status.index_axis(Axis(2), 0).iter().all(|&s| s == 0.));
    assert!(status.index_axis(Axis(2), 1).iter().all(|&s| s != 0.));
}

#[test]
fn volume_series_matches_4d_input() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = small_phantom();
    let mut ds = phantom_data_set(&phantom, dir.path());
    let params = FwdtiParams::default();
    let from_4d = fwdti_exec(&ds, &params).unwrap();
    let f_4d = read_array3(ds.output_dir.join("fw_f")).unwrap();

    let vol_dir = dir.path().join("vols");
    std::fs::create_dir_all(&vol_dir).unwrap();
    for (i, vol) in phantom.data.axis_iter(Axis(3)).enumerate() {
        write_cfl(vol_dir.join(format!("vol{:03}", i)), &vol).unwrap();
    }
    ds.data = None;
    ds.volumes = Some(format!("{}/vol*.cfl", vol_dir.display()));
    ds.output_dir = dir.path().join("out_series");
    let from_series = fwdti_exec(&ds, &params).unwrap();
    let f_series = read_array3(ds.output_dir.join("fw_f")).unwrap();

    assert_eq!(from_4d.free_water_status, from_series.free_water_status);
    assert_eq!(f_4d, f_series);
}

#[test]
fn shells_above_max_bval_are_left_out_of_the_fit() {
    let dir = tempfile::tempdir().unwrap();
    let mut phantom = generate_phantom(&PhantomParams {
        dims: [4, 3, 2],
        bvals: vec![0., 200., 400., 1000., 2000., 3000.],
        max_f: 0.6,
        ..Default::default()
    })
    .unwrap();
    // volumes that would ruin the fit if they were used
    let high = (0..phantom.scheme.len())
        .filter(|&q| phantom.scheme.bvals()[q] > 2500.)
        .collect::<Vec<_>>();
    assert_eq!(high.len(), 32);
    for &q in &high {
        phantom.data.index_axis_mut(Axis(3), q).fill(1.);
    }
    let ds = phantom_data_set(&phantom, dir.path());
    let params = FwdtiParams {
        max_bval: Some(2000.),
        ..Default::default()
    };
    let report = fwdti_exec(&ds, &params).unwrap();

    assert_eq!(report.shells, vec![200., 400., 1000., 2000.]);
    assert_eq!(report.n_measurements, phantom.scheme.len() - high.len());
    assert!(!report.free_water_status.contains_key(&FitStatus::InvalidSignal));

    let fw_f = read_array3(ds.output_dir.join("fw_f")).unwrap();
    let truth_f = read_array3(dir.path().join("truth_f")).unwrap();
    let err = max_abs_error(fw_f.as_slice_memory_order().unwrap(), truth_f.as_slice_memory_order().unwrap());
    assert!(err < 0.01, "max f error {}", err);
}

#[test]
fn data_volume_count_must_match_bvals() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = small_phantom();
    let ds = phantom_data_set(&phantom, dir.path());
    let nq = phantom.scheme.len();
    write_cfl(dir.path().join("data"), &phantom.data.slice(ndarray::s![.., .., .., ..nq - 1])).unwrap();
    let params = FwdtiParams {
        max_bval: Some(2000.),
        ..Default::default()
    };
    assert!(matches!(fwdti_exec(&ds, &params), Err(FwdtiError::Shape(_))));
}

#[test]
fn single_shell_data_is_rejected_before_fitting() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = small_phantom();
    let ds = phantom_data_set(&phantom, dir.path());

    // collapse every weighted measurement onto one shell
    let bvals = phantom
        .scheme
        .bvals()
        .iter()
        .map(|&b| if b > 0. { 1000. } else { 0. })
        .collect::<Vec<_>>();
    AcquisitionScheme::new(bvals, phantom.scheme.bvecs().to_vec(), 50.)
        .unwrap()
        .write_fsl_files(&ds.bvals, &ds.bvecs)
        .unwrap();

    let r = fwdti_exec(&ds, &FwdtiParams::default());
    assert!(matches!(r, Err(FwdtiError::Configuration(_))));
    assert!(!ds.output_dir.exists());
}

#[test]
fn mask_with_wrong_dims_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let phantom = small_phantom();
    let ds = phantom_data_set(&phantom, dir.path());
    write_cfl(dir.path().join("mask"), &ndarray::Array3::<f32>::ones((4, 3, 1))).unwrap();
    assert!(matches!(fwdti_exec(&ds, &FwdtiParams::default()), Err(FwdtiError::Shape(_))));
}
