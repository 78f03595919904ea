use super::{Quant, count, finish_exports};
use crate::bam_ext::BamRecordExtensions;
use crate::config::Config;
use crate::engine::molecule::{Collapse, MoleculeKey};
use crate::engine::partition::Partition;
use crate::engine::worker::PartitionCounter;
use crate::export::{Exports, sparse_matrix, write_count_table, write_h5ad, write_matrix_market};
use crate::gtf::{Annotation, FeatureKind, SplitGuard, Strand};
use crate::matrix::{CountMatrix, PartialCounts, Tally};
use anyhow::{Context, Result, bail};
use nalgebra_sparse::csc::CscMatrix;
use rust_htslib::bam;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::ops::AddAssign;

/// Library protocol. Decides whether the fragment strand must match the gene.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Nla,
    Vasa,
    Cs,
}

impl Method {
    pub fn is_stranded(&self) -> bool {
        match self {
            Method::Nla => false,
            Method::Vasa | Method::Cs => true,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Quantification {
    #[serde(default)]
    method: Method,
    /// only load this many features per gtf (for quick test runs)
    head_features: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TranscriptCounts {
    pub exon: u64,
    pub intron: u64,
    pub junction: u64,
}

impl TranscriptCounts {
    pub fn complete(&self) -> u64 {
        self.exon + self.intron
    }
}

impl AddAssign for TranscriptCounts {
    fn add_assign(&mut self, other: TranscriptCounts) {
        self.exon += other.exon;
        self.intron += other.intron;
        self.junction += other.junction;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptField {
    Exon,
    Intron,
    Junction,
    Complete,
}

impl TranscriptField {
    pub fn of(&self, counts: &TranscriptCounts) -> u64 {
        match self {
            TranscriptField::Exon => counts.exon,
            TranscriptField::Intron => counts.intron,
            TranscriptField::Junction => counts.junction,
            TranscriptField::Complete => counts.complete(),
        }
    }
}

impl Tally for TranscriptCounts {
    type Field = TranscriptField;
    const PRIMARY: TranscriptField = TranscriptField::Complete;

    fn field(&self, field: TranscriptField) -> f64 {
        field.of(self) as f64
    }

    fn is_observed(&self) -> bool {
        self.complete() > 0
    }

    fn units(&self) -> u64 {
        self.complete()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GeneHit {
    /// distinct exon features
    pub exons: BTreeSet<u32>,
    pub intron: bool,
}

/// Everything the reads of one molecule overlapped, by gene number.
#[derive(Debug, Default)]
pub struct MoleculeHits {
    genes: HashMap<u32, GeneHit>,
}

impl Collapse for MoleculeHits {
    fn absorb(&mut self, other: MoleculeHits) {
        for (gene_no, hit) in other.genes {
            let ours = self.genes.entry(gene_no).or_default();
            ours.exons.extend(hit.exons);
            ours.intron |= hit.intron;
        }
    }
}

pub struct TranscriptCounter {
    annotation: Annotation,
    method: Method,
}

impl TranscriptCounter {
    pub fn new(annotation: Annotation, method: Method) -> TranscriptCounter {
        TranscriptCounter { annotation, method }
    }

    pub fn annotation(&self) -> &Annotation {
        &self.annotation
    }

    fn strand_matches(&self, feature: Strand, fragment: Strand) -> bool {
        !self.method.is_stranded() || feature == Strand::Unstranded || feature == fragment
    }
}

impl PartitionCounter for TranscriptCounter {
    type Column = String;
    type Value = TranscriptCounts;
    type Molecule = MoleculeHits;

    fn observe(
        &self,
        partition: &Partition,
        read: &bam::Record,
        molecule: &mut MoleculeHits,
    ) -> Result<()> {
        let fragment = Strand::from_reverse(read.fragment_is_reverse());
        for (start, end) in read.reference_blocks() {
            for hit in self
                .annotation
                .overlapping(FeatureKind::Exon, &partition.contig, start, end)
            {
                if self.strand_matches(hit.strand, fragment) {
                    molecule
                        .genes
                        .entry(hit.gene_no)
                        .or_default()
                        .exons
                        .insert(hit.feature_no);
                }
            }
            for hit in self
                .annotation
                .overlapping(FeatureKind::Intron, &partition.contig, start, end)
            {
                if self.strand_matches(hit.strand, fragment) {
                    molecule.genes.entry(hit.gene_no).or_default().intron = true;
                }
            }
        }
        Ok(())
    }

    fn classify(
        &self,
        _partition: &Partition,
        key: &MoleculeKey,
        molecule: MoleculeHits,
        out: &mut PartialCounts<String, TranscriptCounts>,
    ) -> Result<bool> {
        if molecule.genes.is_empty() {
            out.stats.add("no_feature", 1);
            return Ok(false);
        }
        if molecule.genes.len() > 1 {
            out.stats.add("multiple_genes", 1);
        }
        // smallest gene id wins
        let mut chosen: Option<(&str, &GeneHit)> = None;
        for (gene_no, hit) in molecule.genes.iter() {
            let gene_id = self
                .annotation
                .gene_id(*gene_no)
                .with_context(|| format!("Unknown gene number {gene_no}"))?;
            if chosen.is_none_or(|(best, _)| gene_id < best) {
                chosen = Some((gene_id, hit));
            }
        }
        let Some((gene_id, hit)) = chosen else {
            return Ok(false);
        };
        let counts = TranscriptCounts {
            exon: u64::from(!hit.intron),
            intron: u64::from(hit.intron),
            junction: u64::from(hit.exons.len() >= 2),
        };
        out.add(&key.sample, gene_id.to_string(), counts);
        Ok(true)
    }
}

/// One sparse cells x genes matrix per field, sharing row and column order.
struct TranscriptMatrices {
    cells: Vec<String>,
    genes: Vec<String>,
    exon: CscMatrix<u64>,
    intron: CscMatrix<u64>,
    junction: CscMatrix<u64>,
    complete: CscMatrix<u64>,
}

impl TranscriptMatrices {
    fn new(matrix: &CountMatrix<String, TranscriptCounts>) -> Result<TranscriptMatrices> {
        let (cells, genes, triplets) = matrix.triplets();
        let build = |field: TranscriptField| {
            sparse_matrix(
                cells.len(),
                genes.len(),
                triplets.iter().map(|(r, c, v)| (*r, *c, field.of(v))),
            )
        };
        Ok(TranscriptMatrices {
            exon: build(TranscriptField::Exon)?,
            intron: build(TranscriptField::Intron)?,
            junction: build(TranscriptField::Junction)?,
            complete: build(TranscriptField::Complete)?,
            cells,
            genes,
        })
    }
}

impl Quantification {
    fn export(&self, matrices: &TranscriptMatrices, config: &Config, exports: &mut Exports) {
        let out = &config.output;
        for (name, m) in [
            ("intron", &matrices.intron),
            ("exon", &matrices.exon),
            ("junction", &matrices.junction),
            ("complete", &matrices.complete),
        ] {
            exports.run(
                &format!("sparse {name} matrix"),
                &out.path(&format!("sparse_{name}_matrix.mtx.gz")),
                |path| write_matrix_market(path, m),
            );
        }
        for (filename, m) in [
            ("introns.csv.gz", &matrices.intron),
            ("exons.csv.gz", &matrices.exon),
            ("junctions.csv.gz", &matrices.junction),
            ("counts.csv", &matrices.complete),
        ] {
            exports.run(filename, &out.path(filename), |path| {
                write_count_table(path, &matrices.cells, &matrices.genes, m)
            });
        }

        exports.run("annotated data", &out.path("annotated.h5ad"), |path| {
            write_h5ad(
                path,
                &matrices.cells,
                &matrices.genes,
                &matrices.complete,
                &[
                    ("spliced", &matrices.exon),
                    ("unspliced", &matrices.intron),
                    ("junction", &matrices.junction),
                ],
            )
        });
    }
}

impl Quant for Quantification {
    fn quantify(&self, config: &Config) -> Result<()> {
        let (Some(exon_gtf), Some(intron_gtf)) =
            (&config.input.gtf_exon, &config.input.gtf_intron)
        else {
            bail!("The transcript assay needs input.gtf_exon and input.gtf_intron");
        };
        let annotation = {
            measure_time::info_time!("Loading gene annotation");
            Annotation::from_gtfs(exon_gtf, intron_gtf, self.head_features)?
        };
        let counter = TranscriptCounter::new(annotation, self.method);
        let matrix = count(
            &counter,
            config,
            self.default_bp_per_job(),
            Some(counter.annotation() as &dyn SplitGuard),
        )?;

        let pool = config.runtime.aggregation_pool()?;
        let mut exports = Exports::default();
        {
            measure_time::info_time!("Writing transcript tables");
            pool.install(|| -> Result<()> {
                let matrices = TranscriptMatrices::new(&matrix)
                    .context("Failed to build sparse count matrices")?;
                self.export(&matrices, config, &mut exports);
                Ok(())
            })?;
        }
        finish_exports(exports, config, &matrix);
        Ok(())
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.gtf_exon.is_none() || config.input.gtf_intron.is_none() {
            bail!("The transcript assay needs input.gtf_exon and input.gtf_intron");
        }
        if self.head_features == Some(0) {
            bail!("quant.head_features must be positive (or left out)");
        }
        Ok(())
    }

    fn default_umi_hamming_distance(&self) -> u32 {
        1
    }
}
