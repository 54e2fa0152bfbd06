use clap::Parser;
use fwdti_reco::{calc_scalars, CalcScalarsArgs};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = CalcScalarsArgs::parse();
    calc_scalars(&args)?;
    Ok(())
}
