use super::{Quant, count, finish_exports};
use crate::bam_ext::BamRecordExtensions;
use crate::config::{Config, deser_tag};
use crate::engine::molecule::MoleculeKey;
use crate::engine::partition::Partition;
use crate::engine::worker::PartitionCounter;
use crate::export::{Exports, finish_csv, format_float, sparse_matrix, write_count_table};
use crate::io::create_file;
use crate::matrix::{CountMatrix, PartialCounts, Tally};
use anyhow::Result;
use rust_htslib::bam;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::path::Path;

/// The motif counted as 'TA_start' in the per cell summary.
const TA_MOTIF: &str = "TA";

fn default_motif_tag() -> [u8; 2] {
    *b"RZ"
}

fn serialize_tag<S: serde::Serializer>(tag: &[u8; 2], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(tag))
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Quantification {
    #[serde(
        default = "default_motif_tag",
        deserialize_with = "deser_tag",
        serialize_with = "serialize_tag"
    )]
    motif_tag: [u8; 2],
}

/// Reads observed with one ligation motif.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MotifCount(pub u64);

impl AddAssign for MotifCount {
    fn add_assign(&mut self, other: MotifCount) {
        self.0 += other.0;
    }
}

impl Tally for MotifCount {
    type Field = ();
    const PRIMARY: () = ();

    fn field(&self, _field: ()) -> f64 {
        self.0 as f64
    }

    fn is_observed(&self) -> bool {
        self.0 > 0
    }

    fn units(&self) -> u64 {
        self.0
    }
}

pub struct LigationCounter {
    motif_tag: [u8; 2],
}

impl LigationCounter {
    pub fn new(motif_tag: [u8; 2]) -> LigationCounter {
        LigationCounter { motif_tag }
    }
}

impl PartitionCounter for LigationCounter {
    type Column = String;
    type Value = MotifCount;
    /// every read counts, not just one per molecule
    type Molecule = Vec<String>;

    fn reject(&self, read: &bam::Record) -> Option<&'static str> {
        if !read.is_read1_or_unpaired() {
            Some("not_read1")
        } else if read.is_duplicate() {
            Some("duplicate")
        } else if read.str_tag(&self.motif_tag).is_none() {
            Some("no_ligation_motif")
        } else {
            None
        }
    }

    fn observe(
        &self,
        _partition: &Partition,
        read: &bam::Record,
        molecule: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(motif) = read.str_tag(&self.motif_tag) {
            molecule.push(motif.to_string());
        }
        Ok(())
    }

    fn classify(
        &self,
        _partition: &Partition,
        key: &MoleculeKey,
        molecule: Vec<String>,
        out: &mut PartialCounts<String, MotifCount>,
    ) -> Result<bool> {
        let counted = !molecule.is_empty();
        for motif in molecule {
            out.add(&key.sample, motif, MotifCount(1));
        }
        Ok(counted)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellSummary {
    pub sample: String,
    pub total: u64,
    pub ta_start: u64,
}

impl CellSummary {
    pub fn ta_fraction(&self) -> f64 {
        if self.total == 0 {
            f64::NAN
        } else {
            self.ta_start as f64 / self.total as f64
        }
    }
}

pub fn per_cell_summary(matrix: &CountMatrix<String, MotifCount>) -> Vec<CellSummary> {
    let columns = matrix.columns();
    let ta = TA_MOTIF.to_string();
    matrix
        .rows()
        .into_iter()
        .map(|sample| {
            let total = columns.iter().map(|c| matrix.get(&sample, c).0).sum();
            let ta_start = matrix.get(&sample, &ta).0;
            CellSummary {
                sample,
                total,
                ta_start,
            }
        })
        .collect()
}

fn write_summary(path: &Path, summary: &[CellSummary]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(create_file(path)?);
    writer.write_record(["sample", "total", "TA_start", "TA_fraction"])?;
    for cell in summary {
        writer.write_record([
            cell.sample.clone(),
            cell.total.to_string(),
            cell.ta_start.to_string(),
            format_float(cell.ta_fraction()),
        ])?;
    }
    finish_csv(writer)
}

impl Quant for Quantification {
    fn quantify(&self, config: &Config) -> Result<()> {
        let counter = LigationCounter::new(self.motif_tag);
        let matrix = count(&counter, config, self.default_bp_per_job(), None)?;

        let pool = config.runtime.aggregation_pool()?;
        let mut exports = Exports::default();
        {
            measure_time::info_time!("Writing ligation tables");
            pool.install(|| {
                exports.run(
                    "ligation motifs",
                    &config.output.path("ligation_motifs.csv"),
                    |path| {
                        let (cells, motifs, triplets) = matrix.triplets();
                        let counts = sparse_matrix(
                            cells.len(),
                            motifs.len(),
                            triplets.into_iter().map(|(r, c, v)| (r, c, v.0)),
                        )?;
                        write_count_table(path, &cells, &motifs, &counts)
                    },
                );
                exports.run(
                    "ligation summary",
                    &config.output.path("ligation_per_cell.tsv"),
                    |path| write_summary(path, &per_cell_summary(&matrix)),
                );
            });
        }
        finish_exports(exports, config, &matrix);
        Ok(())
    }
}
