use super::{Quant, count, finish_exports};
use crate::bam_ext::BamRecordExtensions;
use crate::config::Config;
use crate::engine::molecule::{Collapse, MoleculeKey};
use crate::engine::partition::Partition;
use crate::engine::worker::PartitionCounter;
use crate::export::{Exports, format_float, write_bincode, write_frame, write_wig};
use crate::io::{KnownVariants, create_file, read_known_variants};
use crate::matrix::{BulkRow, CountMatrix, PartialCounts, Tally};
use anyhow::{Context, Result, bail};
use rust_htslib::bam::{self, ext::BamRecordExtensions as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::Write;
use std::ops::AddAssign;
use std::path::Path;

/// Bismark's per base methylation string
const METHYLATION_TAG: &[u8; 2] = b"XM";

fn default_contexts() -> Vec<String> {
    vec!["Z".to_string()]
}

fn default_min_samples() -> usize {
    1
}

fn default_min_shared() -> usize {
    5
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Quantification {
    /// bismark context letters, Z = CpG, X = CHG, H = CHH
    #[serde(default = "default_contexts")]
    contexts: Vec<String>,
    /// bins need this many observing samples to make it into the betas
    #[serde(default = "default_min_samples")]
    min_samples: usize,
    #[serde(default)]
    min_variance: f64,
    /// sample pairs need this many shared bins for a distance
    #[serde(default = "default_min_shared")]
    min_shared: usize,

    tabfile: Option<String>,
    bismark_tabfile: Option<String>,
    wig_beta: Option<String>,
    wig_n_samples: Option<String>,
    betas: Option<String>,
    distmat: Option<String>,
}

/// A genomic bin [start, end) on one contig.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinKey {
    pub contig: String,
    pub start: u32,
    pub end: u32,
}

impl Ord for BinKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        natord::compare(&self.contig, &other.contig)
            .then_with(|| self.contig.cmp(&other.contig))
            .then(self.start.cmp(&other.start))
            .then(self.end.cmp(&other.end))
    }
}

impl PartialOrd for BinKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for BinKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}-{}", self.contig, self.start, self.end)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethylationCounts {
    pub methylated: u64,
    pub unmethylated: u64,
}

impl MethylationCounts {
    pub fn call(methylated: bool) -> MethylationCounts {
        if methylated {
            MethylationCounts {
                methylated: 1,
                unmethylated: 0,
            }
        } else {
            MethylationCounts {
                methylated: 0,
                unmethylated: 1,
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.methylated + self.unmethylated
    }

    /// NaN without any calls
    pub fn beta(&self) -> f64 {
        if self.total() == 0 {
            f64::NAN
        } else {
            self.methylated as f64 / self.total() as f64
        }
    }
}

impl AddAssign for MethylationCounts {
    fn add_assign(&mut self, other: MethylationCounts) {
        self.methylated += other.methylated;
        self.unmethylated += other.unmethylated;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethylationField {
    Beta,
}

impl Tally for MethylationCounts {
    type Field = MethylationField;
    const PRIMARY: MethylationField = MethylationField::Beta;

    fn field(&self, field: MethylationField) -> f64 {
        match field {
            MethylationField::Beta => self.beta(),
        }
    }

    fn is_observed(&self) -> bool {
        self.total() > 0
    }

    fn units(&self) -> u64 {
        self.total()
    }
}

/// The calls of one molecule, per reference position.
/// Reads disagreeing about a position make it unusable (None).
#[derive(Debug, Default)]
pub struct MoleculeCalls {
    calls: HashMap<u32, Option<bool>>,
}

impl MoleculeCalls {
    pub fn add(&mut self, pos: u32, methylated: bool) {
        match self.calls.entry(pos) {
            Entry::Vacant(entry) => {
                entry.insert(Some(methylated));
            }
            Entry::Occupied(mut entry) => {
                if *entry.get() != Some(methylated) {
                    entry.insert(None);
                }
            }
        }
    }

    /// (position, call), conflicting positions as None
    pub fn consensus(&self) -> impl Iterator<Item = (u32, Option<bool>)> + '_ {
        self.calls.iter().map(|(pos, call)| (*pos, *call))
    }
}

impl Collapse for MoleculeCalls {
    fn absorb(&mut self, other: MoleculeCalls) {
        for (pos, call) in other.calls {
            match call {
                Some(methylated) => self.add(pos, methylated),
                None => {
                    self.calls.insert(pos, None);
                }
            }
        }
    }
}

pub struct MethylationCounter {
    /// upper case context letters
    contexts: Vec<u8>,
    known_variants: KnownVariants,
}

impl MethylationCounter {
    pub fn new(contexts: &[String], known_variants: KnownVariants) -> MethylationCounter {
        MethylationCounter {
            contexts: contexts
                .iter()
                .filter_map(|c| c.as_bytes().first())
                .map(|c| c.to_ascii_uppercase())
                .collect(),
            known_variants,
        }
    }
}

impl PartitionCounter for MethylationCounter {
    type Column = BinKey;
    type Value = MethylationCounts;
    type Molecule = MoleculeCalls;

    fn reject(&self, read: &bam::Record) -> Option<&'static str> {
        read.str_tag(METHYLATION_TAG)
            .is_none()
            .then_some("no_methylation_tag")
    }

    fn observe(
        &self,
        _partition: &Partition,
        read: &bam::Record,
        molecule: &mut MoleculeCalls,
    ) -> Result<()> {
        let Some(calls) = read.str_tag(METHYLATION_TAG) else {
            return Ok(());
        };
        let calls = calls.as_bytes();
        if calls.len() != read.seq_len() {
            bail!(
                "Methylation string has {} calls for {} bases",
                calls.len(),
                read.seq_len()
            );
        }
        for [qpos, rpos] in read.aligned_pairs() {
            let call = calls[qpos as usize];
            if !self.contexts.contains(&call.to_ascii_uppercase()) {
                continue;
            }
            molecule.add(rpos as u32, call.is_ascii_uppercase());
        }
        Ok(())
    }

    fn classify(
        &self,
        partition: &Partition,
        key: &MoleculeKey,
        molecule: MoleculeCalls,
        out: &mut PartialCounts<BinKey, MethylationCounts>,
    ) -> Result<bool> {
        let bin_size = partition.bin_size;
        let mut counted = false;
        for (pos, call) in molecule.consensus() {
            let Some(methylated) = call else {
                out.stats.add("conflicting_calls", 1);
                continue;
            };
            if self.known_variants.contains(&partition.contig, pos) {
                out.stats.add("known_variant_calls", 1);
                continue;
            }
            let start = pos / bin_size * bin_size;
            out.add(
                &key.sample,
                BinKey {
                    contig: partition.contig.clone(),
                    start,
                    end: start + bin_size,
                },
                MethylationCounts::call(methylated),
            );
            out.stats.add(
                if methylated {
                    "methylated_calls"
                } else {
                    "unmethylated_calls"
                },
                1,
            );
            counted = true;
        }
        Ok(counted)
    }
}

fn write_bulk_table(
    path: &Path,
    bulk: &[BulkRow<BinKey, MethylationCounts>],
    with_spread: bool,
) -> Result<()> {
    let mut out = create_file(path)?;
    out.write_all(b"chr\tstart\tend\tunmethylated\tmethylated\tbeta")?;
    if with_spread {
        out.write_all(b"\tvariance\tn_samples")?;
    }
    out.write_all(b"\n")?;
    for row in bulk {
        let mut line = format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            row.column.contig,
            row.column.start,
            row.column.end,
            row.total.unmethylated,
            row.total.methylated,
            format_float(row.total.beta())
        );
        if with_spread {
            line.push_str(&format!(
                "\t{}\t{}",
                format_float(row.variance),
                row.n_samples
            ));
        }
        line.push('\n');
        out.write_all(line.as_bytes())?;
    }
    out.finish()
}

fn is_binary(filename: &str) -> bool {
    filename.ends_with(".bin")
}

impl Quantification {
    fn export(
        &self,
        matrix: &CountMatrix<BinKey, MethylationCounts>,
        config: &Config,
        exports: &mut Exports,
    ) {
        let needs_bulk = self.tabfile.is_some()
            || self.bismark_tabfile.is_some()
            || self.wig_beta.is_some()
            || self.wig_n_samples.is_some();
        let bulk = if needs_bulk {
            matrix.get_bulk_frame()
        } else {
            Vec::new()
        };
        let span = config.partition.bin_size;

        if let Some(name) = &self.tabfile {
            exports.run("tabfile", &config.output.path(name), |path| {
                write_bulk_table(path, &bulk, true)
            });
        }
        if let Some(name) = &self.bismark_tabfile {
            exports.run("bismark tabfile", &config.output.path(name), |path| {
                write_bulk_table(path, &bulk, false)
            });
        }
        if let Some(name) = &self.wig_beta {
            exports.run("beta track", &config.output.path(name), |path| {
                write_wig(
                    path,
                    span,
                    bulk.iter()
                        .map(|r| (r.column.contig.as_str(), r.column.start, r.total.beta())),
                )
            });
        }
        if let Some(name) = &self.wig_n_samples {
            exports.run("sample count track", &config.output.path(name), |path| {
                write_wig(
                    path,
                    span,
                    bulk.iter().map(|r| {
                        (
                            r.column.contig.as_str(),
                            r.column.start,
                            r.n_samples as f64,
                        )
                    }),
                )
            });
        }
        if let Some(name) = &self.betas {
            exports.run("betas", &config.output.path(name), |path| {
                let frame = matrix
                    .get_frame(MethylationField::Beta)
                    .prune(self.min_samples, self.min_variance);
                log::info!(
                    "{} of {} bins pass min_samples / min_variance",
                    frame.columns.len(),
                    matrix.columns().len()
                );
                if is_binary(name) {
                    write_bincode(path, &frame)
                } else {
                    write_frame(path, &frame, b',', |c| c.to_string())
                }
            });
        }
        if let Some(name) = &self.distmat {
            exports.run("distance matrix", &config.output.path(name), |path| {
                let distances = matrix.get_sample_distance_matrix(self.min_shared);
                if is_binary(name) {
                    write_bincode(path, &distances)
                } else {
                    write_frame(path, &distances, b'\t', |c| c.clone())
                }
            });
        }
    }
}

impl Quant for Quantification {
    fn quantify(&self, config: &Config) -> Result<()> {
        let known_variants = match &config.input.known_variants {
            Some(filename) => {
                let known = read_known_variants(filename)
                    .with_context(|| format!("Failed to read known variants from {filename}"))?;
                if known.is_empty() {
                    log::warn!("No known variant positions in {filename}");
                } else {
                    log::info!("Excluding {} known variant positions", known.len());
                }
                known
            }
            None => KnownVariants::default(),
        };
        let counter = MethylationCounter::new(&self.contexts, known_variants);
        let matrix = count(&counter, config, self.default_bp_per_job(), None)?;

        let pool = config.runtime.aggregation_pool()?;
        let mut exports = Exports::default();
        {
            measure_time::info_time!("Writing methylation tables");
            pool.install(|| self.export(&matrix, config, &mut exports));
        }
        finish_exports(exports, config, &matrix);
        Ok(())
    }

    fn check(&self, _config: &Config) -> Result<()> {
        if self.contexts.is_empty() {
            bail!("quant.contexts must name at least one context");
        }
        for context in self.contexts.iter() {
            if context.len() != 1 || !context.as_bytes()[0].is_ascii_alphabetic() {
                bail!("quant.contexts: '{context}' is not a single bismark context letter");
            }
        }
        if self.min_variance.is_nan() || self.min_variance < 0.0 {
            bail!("quant.min_variance must be >= 0");
        }
        if self.min_shared == 0 {
            bail!("quant.min_shared must be at least 1");
        }
        Ok(())
    }

    fn default_bp_per_job(&self) -> Option<u32> {
        Some(1_000_000)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::TestRead;
    use rust_htslib::bam::record::Cigar;

    fn partition() -> Partition {
        Partition {
            id: 0,
            contig: "chr1".to_string(),
            tid: 0,
            start: 0,
            end: 10_000,
            bin_size: 100,
        }
    }

    fn key(sample: &str) -> MoleculeKey {
        MoleculeKey {
            sample: sample.to_string(),
            umi: String::new(),
            reverse: false,
            anchor: 0,
        }
    }

    fn counter(known: KnownVariants) -> MethylationCounter {
        MethylationCounter::new(&["Z".to_string()], known)
    }

    #[test]
    fn test_bin_order_is_natural() {
        let bin = |contig: &str, start| BinKey {
            contig: contig.to_string(),
            start,
            end: start + 10,
        };
        let mut bins = vec![bin("chr10", 0), bin("chr2", 10), bin("chr2", 0), bin("chr1", 0)];
        bins.sort();
        let names: Vec<String> = bins.iter().map(|b| b.to_string()).collect();
        assert_eq!(names, vec!["chr1:0-10", "chr2:0-10", "chr2:10-20", "chr10:0-10"]);
    }

    #[test]
    fn test_beta() {
        let mut counts = MethylationCounts {
            methylated: 2,
            unmethylated: 3,
        };
        counts += MethylationCounts::call(true);
        assert_eq!(counts.beta(), 0.5);
        assert!(MethylationCounts::default().beta().is_nan());
        assert!(
            MethylationCounts::default()
                .field(MethylationField::Beta)
                .is_nan()
        );
    }

    #[test]
    fn test_consensus_drops_conflicts() {
        let mut calls = MoleculeCalls::default();
        calls.add(10, true);
        calls.add(10, true);
        calls.add(20, true);
        calls.add(20, false);
        calls.add(20, true);
        let mut consensus: Vec<_> = calls.consensus().collect();
        consensus.sort();
        assert_eq!(consensus, vec![(10, Some(true)), (20, None)]);

        let mut other = MoleculeCalls::default();
        other.add(10, false);
        other.add(30, true);
        other.add(20, true);
        calls.absorb(other);
        let mut consensus: Vec<_> = calls.consensus().collect();
        consensus.sort();
        assert_eq!(consensus, vec![(10, None), (20, None), (30, Some(true))]);
    }

    #[test]
    fn test_observe_follows_alignment() {
        // 2 soft clipped, 3 matched, 1 inserted, 2 deleted, 3 matched
        let read = TestRead::new("r", 0, 100)
            .cigar(vec![
                Cigar::SoftClip(2),
                Cigar::Match(3),
                Cigar::Ins(1),
                Cigar::Del(2),
                Cigar::Match(3),
            ])
            .xm("ZZz.ZZ.xZ")
            .record()
            .unwrap();
        let mut calls = MoleculeCalls::default();
        counter(KnownVariants::default())
            .observe(&partition(), &read, &mut calls)
            .unwrap();
        let mut consensus: Vec<_> = calls.consensus().collect();
        consensus.sort();
        // qpos 2 -> 100 z, qpos 3 -> 101 ., qpos 4 -> 102 Z, qpos 5 inserted
        // qpos 6 -> 105 ., qpos 7 -> 106 x (not a CpG), qpos 8 -> 107 Z
        assert_eq!(
            consensus,
            vec![(100, Some(false)), (102, Some(true)), (107, Some(true))]
        );
    }

    #[test]
    fn test_observe_rejects_bad_length() {
        let read = TestRead::new("r", 0, 100)
            .seq("ACGTA")
            .tag(b"XM", "Z.")
            .record()
            .unwrap();
        let mut calls = MoleculeCalls::default();
        assert!(
            counter(KnownVariants::default())
                .observe(&partition(), &read, &mut calls)
                .is_err()
        );
        let untagged = TestRead::new("u", 0, 100).record().unwrap();
        assert_eq!(
            counter(KnownVariants::default()).reject(&untagged),
            Some("no_methylation_tag")
        );
    }

    #[test]
    fn test_classify_bins_and_known_variants() {
        let mut known = KnownVariants::default();
        known.insert("chr1", 150);
        let counter = counter(known);
        let mut calls = MoleculeCalls::default();
        calls.add(10, true);
        calls.add(99, false);
        calls.add(100, true);
        calls.add(150, true);
        calls.add(160, true);
        calls.add(160, false);
        let mut out = PartialCounts::new("chr1:0-10000");
        assert!(
            counter
                .classify(&partition(), &key("A"), calls, &mut out)
                .unwrap()
        );
        let bin = |start| BinKey {
            contig: "chr1".to_string(),
            start,
            end: start + 100,
        };
        assert_eq!(
            out.get("A", &bin(0)),
            Some(&MethylationCounts {
                methylated: 1,
                unmethylated: 1
            })
        );
        assert_eq!(out.get("A", &bin(100)), Some(&MethylationCounts::call(true)));
        assert_eq!(out.stats.get("known_variant_calls"), 1);
        assert_eq!(out.stats.get("conflicting_calls"), 1);
        assert_eq!(out.stats.get("methylated_calls"), 2);

        let mut out = PartialCounts::new("x");
        assert!(
            !counter
                .classify(&partition(), &key("A"), MoleculeCalls::default(), &mut out)
                .unwrap()
        );
    }

    #[test]
    fn test_write_bulk_table() {
        let td = tempfile::tempdir().unwrap();
        let bulk = vec![BulkRow {
            column: BinKey {
                contig: "chr1".to_string(),
                start: 0,
                end: 500,
            },
            total: MethylationCounts {
                methylated: 1,
                unmethylated: 3,
            },
            variance: f64::NAN,
            n_samples: 1,
        }];
        let path = td.path().join("bulk.tsv");
        write_bulk_table(&path, &bulk, true).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "chr\tstart\tend\tunmethylated\tmethylated\tbeta\tvariance\tn_samples\nchr1\t0\t500\t3\t1\t0.25\t\t1\n"
        );
        write_bulk_table(&path, &bulk, false).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "chr\tstart\tend\tunmethylated\tmethylated\tbeta\nchr1\t0\t500\t3\t1\t0.25\n"
        );
    }

    #[test]
    fn test_config_check() {
        let parse = |s: &str| toml::from_str::<Quantification>(s).unwrap();
        let q = parse("");
        assert_eq!(q.contexts, vec!["Z"]);
        assert_eq!(q.min_shared, 5);
        let config: Config = toml::from_str(
            "[input]\nbam = 'x.bam'\n[quant]\nmode = 'methylation'\n[output]\ndirectory = 'o'\n",
        )
        .unwrap();
        assert!(q.check(&config).is_ok());
        assert!(parse("contexts = ['ZX']").check(&config).is_err());
        assert!(parse("contexts = []").check(&config).is_err());
        assert!(parse("min_variance = -1.0").check(&config).is_err());
        assert_eq!(q.default_bp_per_job(), Some(1_000_000));
    }
}
