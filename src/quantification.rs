mod ligation;
mod methylation;
mod transcripts;

use crate::config::Config;
use crate::engine::molecule::MoleculeTags;
use crate::engine::partition::{Partition, generate_partitions};
use crate::engine::run_partitions;
use crate::engine::worker::{PartitionCounter, WorkerSettings};
use crate::export::{Exports, write_stats};
use crate::gtf::SplitGuard;
use crate::io::{contigs_from_bam, open_indexed_bam};
use crate::matrix::CountMatrix;
use anyhow::{Context, Result};
use enum_dispatch::enum_dispatch;
use std::path::PathBuf;
use std::time::Duration;

pub use ligation::{LigationCounter, MotifCount};
pub use methylation::{BinKey, MethylationCounter, MethylationCounts, MethylationField};
pub use transcripts::{Method, TranscriptCounter, TranscriptCounts, TranscriptField};

#[enum_dispatch(Quantification)]
pub trait Quant {
    fn quantify(&self, config: &Config) -> Result<()>;

    fn check(&self, _config: &Config) -> Result<()> {
        Ok(())
    }

    /// partition size if the config doesn't set one, None for whole contigs
    fn default_bp_per_job(&self) -> Option<u32> {
        None
    }

    /// umi mismatches still counted as one molecule, if the config doesn't say
    fn default_umi_hamming_distance(&self) -> u32 {
        0
    }
}

#[derive(serde::Deserialize, Debug, Clone, strum_macros::Display, serde::Serialize)]
#[serde(tag = "mode")]
#[enum_dispatch]
pub enum Quantification {
    #[serde(alias = "methylation")]
    Methylation(methylation::Quantification),
    #[serde(alias = "transcripts", alias = "rna")]
    Transcripts(transcripts::Quantification),
    #[serde(alias = "ligation")]
    Ligation(ligation::Quantification),
}

pub(crate) fn worker_settings(config: &Config) -> WorkerSettings {
    WorkerSettings {
        bam: PathBuf::from(&config.input.bam),
        filters: config.filter.read_filters(),
        tags: MoleculeTags {
            sample: config.filter.sample_tag,
            umi: config.filter.umi_tag,
            site: config.filter.site_tag,
        },
        fetch_margin: config.partition.fetch_margin,
        maxtime: config.filter.maxtime.map(Duration::from_secs),
        max_umi_distance: config
            .filter
            .umi_hamming_distance
            .unwrap_or_else(|| config.quantification.default_umi_hamming_distance()),
    }
}

/// Read the contigs from the bam and split them up.
pub(crate) fn partitions(
    config: &Config,
    default_bp_per_job: Option<u32>,
    guard: Option<&dyn SplitGuard>,
) -> Result<Vec<Partition>> {
    let mut bam = open_indexed_bam(&config.input.bam)?;
    let contigs = contigs_from_bam(&mut bam)?;
    let mut partitioning = config.partition.clone();
    if partitioning.bp_per_job.is_none() {
        partitioning.bp_per_job = default_bp_per_job;
    }
    let partitions = generate_partitions(&contigs, &partitioning, guard)
        .context("Failed to partition the genome")?;
    log::info!(
        "Generated {} partitions over {} contigs",
        partitions.len(),
        contigs.len()
    );
    Ok(partitions)
}

/// Partition the bam, then count every partition.
pub(crate) fn count<W: PartitionCounter>(
    counter: &W,
    config: &Config,
    default_bp_per_job: Option<u32>,
    guard: Option<&dyn SplitGuard>,
) -> Result<CountMatrix<W::Column, W::Value>> {
    let partitions = partitions(config, default_bp_per_job, guard)?;
    let settings = worker_settings(config);
    let matrix = run_partitions(
        counter,
        &settings,
        &partitions,
        config.runtime.counting_threads(),
    )?;
    if matrix.partitions_timed_out() > 0 {
        log::warn!(
            "{} partitions hit the time budget, counts are incomplete",
            matrix.partitions_timed_out()
        );
    }
    log::info!(
        "Counted {} molecules in {} samples",
        matrix.stats().get("molecules_counted"),
        matrix.rows().len()
    );
    Ok(matrix)
}

/// Writes stats.tsv, then reports how the exports went.
pub(crate) fn finish_exports<C, V>(
    mut exports: Exports,
    config: &Config,
    matrix: &CountMatrix<C, V>,
) where
    C: crate::matrix::ColumnKey,
    V: crate::matrix::Tally,
{
    let mut stats = matrix.stats().clone();
    stats.add("partitions", matrix.partitions_merged() as u64);
    stats.add("partitions_timed_out", matrix.partitions_timed_out() as u64);
    exports.run("statistics", &config.output.path("stats.tsv"), |path| {
        write_stats(path, &stats)
    });
    exports.report();
}
