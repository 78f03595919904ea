use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer};
use serde_valid::Validate;
use std::path::PathBuf;

use crate::filters::{Filter, ReadFilters};
use crate::quantification::{Quant, Quantification};

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub input: Input,
    #[serde(default)]
    pub partition: Partitioning,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(alias = "quant")]
    pub quantification: Quantification,
    pub output: Output,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Input {
    pub bam: String,
    pub known_variants: Option<String>,
    pub gtf_exon: Option<String>,
    pub gtf_intron: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Output {
    pub directory: String,
}

impl Output {
    pub fn path(&self, filename: &str) -> PathBuf {
        PathBuf::from(&self.directory).join(filename)
    }
}

pub fn deser_tag<'de, D>(deserializer: D) -> core::result::Result<[u8; 2], D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let bytes = s.as_bytes();
    if bytes.len() != 2 || !bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
        return Err(serde::de::Error::custom(format!(
            "BAM tags are exactly two alphanumeric characters, found '{s}'"
        )));
    }
    Ok([bytes[0], bytes[1]])
}

pub fn deser_regexes<'de, D>(deserializer: D) -> core::result::Result<Vec<regex::Regex>, D::Error>
where
    D: Deserializer<'de>,
{
    let patterns: Vec<String> = Deserialize::deserialize(deserializer)?;
    patterns
        .iter()
        .map(|s| {
            regex::Regex::new(s)
                .map_err(|e| serde::de::Error::custom(format!("Invalid regex: {e}")))
        })
        .collect()
}

fn default_bin_size() -> u32 {
    500
}

fn default_fetch_margin() -> u32 {
    1000
}

fn default_skip_contigs() -> Vec<String> {
    vec!["MT".to_string(), "chrM".to_string()]
}

/// How the genome is split into units of work.
#[derive(Deserialize, Debug, Clone, Validate)]
#[serde(deny_unknown_fields)]
pub struct Partitioning {
    #[serde(default = "default_bin_size")]
    #[validate(minimum = 1)]
    pub bin_size: u32,
    /// None: use the assay's default, see Quant::default_bp_per_job
    #[serde(default)]
    pub bp_per_job: Option<u32>,
    /// mitochondrial contigs are skipped unless this is set
    #[serde(default = "default_skip_contigs")]
    pub skip_contigs: Vec<String>,
    /// none by default. For transcripts you usually want
    /// "^ERCC", "^chrUn", "_random$", "^GL" and "^JH"
    #[serde(default, deserialize_with = "deser_regexes")]
    pub skip_contig_patterns: Vec<regex::Regex>,
    /// only process these contigs
    #[serde(default)]
    pub contigs: Option<Vec<String>>,
    /// only generate this many partitions (for quick test runs)
    #[serde(default)]
    pub head: Option<usize>,
    /// extra bases fetched on both sides of a partition,
    /// so reads whose anchor lies inside but who start outside are seen.
    /// Should cover the longest fragment, or the right mate is lost.
    #[serde(default = "default_fetch_margin")]
    pub fetch_margin: u32,
}

impl Default for Partitioning {
    fn default() -> Self {
        Partitioning {
            bin_size: default_bin_size(),
            bp_per_job: None,
            skip_contigs: default_skip_contigs(),
            skip_contig_patterns: Vec::new(),
            contigs: None,
            head: None,
            fetch_margin: default_fetch_margin(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_mapping_quality() -> u8 {
    40
}

fn default_sample_tag() -> [u8; 2] {
    *b"SM"
}

fn default_umi_tag() -> [u8; 2] {
    *b"RX"
}

fn default_site_tag() -> [u8; 2] {
    *b"DS"
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default = "default_min_mapping_quality")]
    pub min_mapping_quality: u8,
    #[serde(default = "default_true")]
    pub dedup: bool,
    /// wall clock budget per partition, in seconds
    #[serde(default)]
    pub maxtime: Option<u64>,
    #[serde(default = "default_sample_tag", deserialize_with = "deser_tag")]
    pub sample_tag: [u8; 2],
    #[serde(default = "default_umi_tag", deserialize_with = "deser_tag")]
    pub umi_tag: [u8; 2],
    #[serde(default = "default_site_tag", deserialize_with = "deser_tag")]
    pub site_tag: [u8; 2],
    /// umis at one position differing in at most this many bases are one molecule.
    /// None: 1 for transcripts, 0 (exact match) otherwise
    #[serde(default)]
    pub umi_hamming_distance: Option<u32>,
    #[serde(default)]
    pub extra: Vec<Filter>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            min_mapping_quality: default_min_mapping_quality(),
            dedup: true,
            maxtime: None,
            sample_tag: default_sample_tag(),
            umi_tag: default_umi_tag(),
            site_tag: default_site_tag(),
            umi_hamming_distance: None,
            extra: Vec::new(),
        }
    }
}

impl FilterConfig {
    pub fn read_filters(&self) -> ReadFilters {
        ReadFilters {
            min_mapping_quality: self.min_mapping_quality,
            dedup: self.dedup,
            extra: self.extra.clone(),
        }
    }
}

fn default_threads_agg() -> usize {
    1
}

#[derive(Deserialize, Debug, Clone, Validate)]
#[serde(deny_unknown_fields)]
pub struct Runtime {
    /// counting threads, None for all cores
    #[serde(default)]
    pub threads: Option<usize>,
    /// threads for building the derived frames
    #[serde(default = "default_threads_agg")]
    #[validate(minimum = 1)]
    pub threads_agg: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime {
            threads: None,
            threads_agg: default_threads_agg(),
        }
    }
}

impl Runtime {
    pub fn counting_threads(&self) -> usize {
        self.threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|x| x.get())
                    .unwrap_or(1)
            })
            .max(1)
    }

    pub fn aggregation_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads_agg)
            .build()
            .context("Failed to build aggregation thread pool")
    }
}

impl Config {
    pub fn check(&self) -> Result<()> {
        self.partition
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid [partition] section: {e}"))?;
        self.runtime
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid [runtime] section: {e}"))?;
        if self.runtime.threads == Some(0) {
            bail!("runtime.threads must be at least 1 (or left out to use all cores)");
        }
        if self.partition.bp_per_job == Some(0) {
            bail!("partition.bp_per_job must be positive");
        }
        if self.filter.maxtime == Some(0) {
            bail!("filter.maxtime must be positive (or left out for no limit)");
        }
        self.quantification.check(self)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MINIMAL: &str = r#"
[input]
bam = "cells.bam"

[quant]
mode = "methylation"

[output]
directory = "out"
"#;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.partition.bin_size, 500);
        assert_eq!(config.partition.bp_per_job, None);
        assert_eq!(config.partition.fetch_margin, 1000);
        assert_eq!(config.partition.skip_contigs, vec!["MT", "chrM"]);
        assert!(config.partition.skip_contig_patterns.is_empty());
        assert_eq!(config.filter.min_mapping_quality, 40);
        assert_eq!(config.filter.umi_hamming_distance, None);
        assert!(config.filter.dedup);
        assert_eq!(&config.filter.sample_tag, b"SM");
        assert_eq!(config.runtime.threads_agg, 1);
        assert!(config.runtime.counting_threads() >= 1);
        assert_eq!(config.quantification.to_string(), "Methylation");
        config.check().unwrap();
        assert_eq!(Partitioning::default().skip_contigs, vec!["MT", "chrM"]);
        assert_eq!(FilterConfig::default().min_mapping_quality, 40);
    }

    #[test]
    fn test_full_sections() {
        let config: Config = toml::from_str(
            r#"
[input]
bam = "cells.bam"
known_variants = "known.vcf"

[partition]
bin_size = 1
bp_per_job = 5000
skip_contigs = ["chrM"]
skip_contig_patterns = ["^ERCC", "_random$"]
head = 3

[filter]
min_mapping_quality = 20
dedup = false
umi_hamming_distance = 2
maxtime = 60
umi_tag = "UB"
extra = [{mode = "multimapper", action = "remove"}]

[runtime]
threads = 2
threads_agg = 2

[quant]
mode = "methylation"
contexts = ["Z", "X"]
min_samples = 2

[output]
directory = "out"
"#,
        )
        .unwrap();
        assert_eq!(config.partition.skip_contig_patterns.len(), 2);
        assert!(config.partition.skip_contig_patterns[1].is_match("chr1_random"));
        assert_eq!(&config.filter.umi_tag, b"UB");
        assert_eq!(config.filter.read_filters().min_mapping_quality, 20);
        assert_eq!(config.filter.umi_hamming_distance, Some(2));
        assert_eq!(config.runtime.counting_threads(), 2);
        config.check().unwrap();
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_tag = MINIMAL.replace("[output]", "[filter]\nsample_tag = \"SMX\"\n[output]");
        assert!(toml::from_str::<Config>(&bad_tag).is_err());

        let unknown = MINIMAL.replace("[output]", "[filter]\nmapq = 3\n[output]");
        assert!(toml::from_str::<Config>(&unknown).is_err());

        let bad_regex =
            MINIMAL.replace("[output]", "[partition]\nskip_contig_patterns = [\"(\"]\n[output]");
        assert!(toml::from_str::<Config>(&bad_regex).is_err());

        let zero_bin = MINIMAL.replace("[output]", "[partition]\nbin_size = 0\n[output]");
        let config: Config = toml::from_str(&zero_bin).unwrap();
        assert!(config.check().is_err());

        let zero_threads = MINIMAL.replace("[output]", "[runtime]\nthreads = 0\n[output]");
        let config: Config = toml::from_str(&zero_threads).unwrap();
        assert!(config.check().is_err());
    }
}
