use anyhow::Context;
use clap::Parser;
use fwdti_reco::{fwdti_exec, DataSetParams, FwdtiParams};
use std::fs;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let ds_params = DataSetParams::parse();
    let params_file = ds_params.fit_params.with_extension("toml");
    let toml_str = fs::read_to_string(&params_file)
        .with_context(|| format!("failed to open config file {}", params_file.display()))?;
    let params = toml::from_str::<FwdtiParams>(&toml_str)
        .with_context(|| format!("failed to parse fit params file {}", params_file.display()))?;
    let report = fwdti_exec(&ds_params, &params)?;
    println!(
        "fitted {} voxels in {:.03} secs, mean free water fraction {:.03}",
        report.n_voxels_fitted, report.free_water_elapsed_secs, report.mean_f
    );
    Ok(())
}
