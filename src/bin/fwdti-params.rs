use anyhow::Context;
use clap::Parser;
use fwdti_reco::FwdtiParams;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Args {
    /// path to fit parameters file to write
    parameter_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let params = FwdtiParams::default();
    let mut toml_string = toml::to_string(&params).context("failed to serialize default parameters")?;
    toml_string.push('\n');
    let filename = args.parameter_file.with_extension("toml");
    let mut f = File::create(&filename).with_context(|| format!("failed to create {}", filename.display()))?;
    f.write_all(toml_string.as_bytes())
        .with_context(|| format!("failed to write {}", filename.display()))?;
    println!("wrote default parameter file to {}", filename.display());
    Ok(())
}
