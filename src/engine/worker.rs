use super::molecule::{Collapse, MoleculeKey, MoleculeTags, Molecules};
use super::partition::Partition;
use crate::filters::{ReadFilters, Rejection};
use crate::matrix::{ColumnKey, PartialCounts, Tally};
use anyhow::{Context, Result};
use rust_htslib::bam::{self, Read};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// How often (in records) the wall clock budget is checked.
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

/// What an assay does with the reads of one partition.
pub trait PartitionCounter: Sync {
    type Column: ColumnKey;
    type Value: Tally;
    /// whatever the assay needs to remember about one molecule
    type Molecule: Default + Send + Collapse;

    /// Assay specific rejection, after the common filters passed.
    /// Returns the stats key the read is counted under.
    fn reject(&self, _read: &bam::Record) -> Option<&'static str> {
        None
    }

    /// Fold one read into its molecule.
    fn observe(
        &self,
        partition: &Partition,
        read: &bam::Record,
        molecule: &mut Self::Molecule,
    ) -> Result<()>;

    /// Turn a finished molecule into counts.
    /// Returns whether anything was counted.
    fn classify(
        &self,
        partition: &Partition,
        key: &MoleculeKey,
        molecule: Self::Molecule,
        out: &mut PartialCounts<Self::Column, Self::Value>,
    ) -> Result<bool>;
}

/// Static, read-only configuration shared by every partition.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub bam: PathBuf,
    pub filters: ReadFilters,
    pub tags: MoleculeTags,
    pub fetch_margin: u32,
    pub maxtime: Option<Duration>,
    /// umis at one position this close are one molecule
    pub max_umi_distance: u32,
}

/// Count one partition.
///
/// Every read whose anchor lies inside the partition is seen exactly once,
/// reads anchored elsewhere belong to another partition and are skipped
/// without touching the statistics.
pub fn count_partition<W: PartitionCounter>(
    counter: &W,
    settings: &WorkerSettings,
    partition: &Partition,
) -> Result<PartialCounts<W::Column, W::Value>> {
    let mut result = PartialCounts::new(partition.str_id());
    let mut bam = crate::io::open_indexed_bam(&settings.bam)?;
    let fetch_start = partition.start.saturating_sub(settings.fetch_margin);
    let fetch_end = partition.end.saturating_add(settings.fetch_margin);
    bam.fetch((partition.tid, fetch_start as u64, fetch_end as u64))
        .with_context(|| format!("Failed to fetch {}", partition.str_id()))?;

    let deadline = settings.maxtime.map(|budget| Instant::now() + budget);
    let mut molecules: Molecules<W::Molecule> = Molecules::default();
    let mut read = bam::Record::new();
    let mut seen = 0u64;
    let mut outside = 0u64;
    while let Some(bam_result) = bam.read(&mut read) {
        bam_result.with_context(|| format!("Failed to read record in {}", partition.str_id()))?;
        seen += 1;
        if seen % DEADLINE_CHECK_INTERVAL == 0 && deadline.is_some_and(|d| Instant::now() > d) {
            log::warn!(
                "Time budget exceeded in {}, stopping after {} records",
                partition.str_id(),
                seen
            );
            result.timed_out = true;
            break;
        }
        let Some(anchor) = settings.tags.anchor(&read) else {
            outside += 1;
            continue;
        };
        if !partition.contains(anchor) {
            outside += 1;
            continue;
        }
        result.stats.add("records", 1);
        if let Some(rejection) = settings.filters.check(&read)? {
            result.stats.add(&rejection.to_string(), 1);
            continue;
        }
        if let Some(reason) = counter.reject(&read) {
            result.stats.add(reason, 1);
            continue;
        }
        let Some(sample) = settings.tags.sample(&read) else {
            result.stats.add(&Rejection::NoSample.to_string(), 1);
            continue;
        };
        let key = settings.tags.key(&read, sample, anchor);
        counter
            .observe(partition, &read, molecules.read_for(key))
            .with_context(|| {
                format!(
                    "Failed to process read {}",
                    String::from_utf8_lossy(read.qname())
                )
            })?;
        result.stats.add("accepted", 1);
    }
    log::debug!(
        "{}: {} records fetched, {} anchored elsewhere, {} molecules",
        partition.str_id(),
        seen,
        outside,
        molecules.len()
    );

    let before_collapse = molecules.len();
    let molecules = molecules.into_sorted(settings.max_umi_distance);
    if molecules.len() < before_collapse {
        result
            .stats
            .add("umi_collapsed", (before_collapse - molecules.len()) as u64);
    }
    result.stats.add("molecules", molecules.len() as u64);
    for (key, molecule, _reads) in molecules {
        if counter.classify(partition, &key, molecule, &mut result)? {
            result.stats.add("molecules_counted", 1);
        }
    }
    Ok(result)
}
