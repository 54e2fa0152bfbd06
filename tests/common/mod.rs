//! Shared helpers for the workflow integration tests

use fwdti_reco::phantom::{generate_phantom, Phantom, PhantomParams};
use fwdti_reco::DataSetParams;
use std::path::Path;

/// a small noise free phantom with free water fractions from 0 to 0.6 along x
pub fn small_phantom() -> Phantom {
    generate_phantom(&PhantomParams {
        dims: [4, 3, 2],
        max_f: 0.6,
        ..Default::default()
    })
    .unwrap()
}

/// writes the phantom to `dir` and returns dataset arguments pointing at it
pub fn phantom_data_set(phantom: &Phantom, dir: &Path) -> DataSetParams {
    phantom.write(dir).unwrap();
    DataSetParams {
        data: Some(dir.join("data")),
        volumes: None,
        bvals: dir.join("bvals"),
        bvecs: dir.join("bvecs"),
        mask: Some(dir.join("mask")),
        axial_slice: None,
        fit_params: dir.join("params.toml"),
        output_dir: dir.join("out"),
    }
}

/// largest absolute difference between two equally sized slices
pub fn max_abs_error(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0., f32::max)
}
