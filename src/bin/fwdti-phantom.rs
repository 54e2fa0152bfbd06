use anyhow::Context;
use clap::Parser;
use fwdti_reco::phantom::{generate_phantom, PhantomParams};
use log::info;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Args {
    /// directory to write the synthetic data set to
    output_dir: PathBuf,
    /// toml file with phantom parameters. Defaults are used if not set
    #[arg(long)]
    params: Option<PathBuf>,
    /// standard deviation of the rician noise
    #[arg(long)]
    noise_sigma: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut params = match &args.params {
        Some(p) => {
            let toml_str = fs::read_to_string(p).with_context(|| format!("failed to open {}", p.display()))?;
            toml::from_str::<PhantomParams>(&toml_str).with_context(|| format!("failed to parse {}", p.display()))?
        }
        None => PhantomParams::default(),
    };
    if let Some(sigma) = args.noise_sigma {
        params.noise_sigma = sigma;
    }
    if let Some(seed) = args.seed {
        params.seed = seed;
    }

    info!("generating phantom with dims {:?} ...", params.dims);
    let phantom = generate_phantom(&params)?;
    phantom.write(&args.output_dir)?;
    info!("wrote {} measurements to {}", phantom.scheme.len(), args.output_dir.display());
    Ok(())
}
