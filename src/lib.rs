use anyhow::{Context, Result};
use std::path::Path;

pub mod bam_ext;
pub mod categorical;
pub mod config;
pub mod engine;
pub mod export;
pub mod filters;
pub mod gtf;
pub mod io;
pub mod matrix;
pub mod quantification;
#[doc(hidden)]
pub mod testing;

use config::Config;
use quantification::Quant;

pub fn run(toml_file: &Path) -> Result<()> {
    let raw_config = ex::fs::read_to_string(toml_file)
        .with_context(|| format!("Could not read toml file: {}", toml_file.to_string_lossy()))?;
    let parsed = toml::from_str::<Config>(&raw_config)
        .with_context(|| format!("Could not parse toml file: {}", toml_file.to_string_lossy()))?;
    parsed.check().context("Error in configuration")?;
    ex::fs::create_dir_all(&parsed.output.directory)?;

    log::info!(
        "Quantifying {} with the {} assay",
        parsed.input.bam,
        parsed.quantification
    );
    parsed
        .quantification
        .quantify(&parsed)
        .context("Error in quantification")?;

    Ok(())
}
