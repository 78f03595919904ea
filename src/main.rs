use anyhow::{Result, bail};
use env_logger::Env;
use mimalloc::MiMalloc;
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<()> {
    human_panic::setup_panic!();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 1 {
        bail!("Usage: cell-bam-counts <config.toml>");
    }
    cell_bam_counts::run(&PathBuf::from(&args[0]))
}
