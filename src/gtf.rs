use crate::categorical::Categorical;
use crate::io::open_file;
use anyhow::{Context, Result, bail};
use bio::data_structures::interval_tree::IntervalTree;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    Plus,
    Minus,
    Unstranded,
}

impl Strand {
    pub fn from_gtf(s: &str) -> Strand {
        match s {
            "+" => Strand::Plus,
            "-" => Strand::Minus,
            _ => Strand::Unstranded,
        }
    }

    pub fn from_reverse(is_reverse: bool) -> Strand {
        if is_reverse { Strand::Minus } else { Strand::Plus }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureHit {
    pub gene_no: u32,
    /// unique per loaded feature, so two exons of one gene can be told apart
    pub feature_no: u32,
    pub strand: Strand,
}

pub type FeatureTree = IntervalTree<u32, FeatureHit>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtfFeature {
    pub seqname: String,
    /// 0-based, half open
    pub start: u32,
    pub end: u32,
    pub strand: Strand,
    pub gene_id: String,
}

fn gene_id_from_attributes(attributes: &str) -> Option<&str> {
    attributes
        .split_terminator(';')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .find_map(|kv| {
            let (key, value) = kv.split_once(' ')?;
            (key == "gene_id").then(|| value.trim().trim_matches('"'))
        })
}

/// Read all features of one type (e.g. 'exon') from a (possibly compressed) gtf.
/// `head` stops after that many accepted features.
pub fn read_gtf_features(
    filename: impl AsRef<Path>,
    feature_type: &str,
    head: Option<usize>,
) -> Result<Vec<GtfFeature>> {
    let filename = filename.as_ref();
    let f = BufReader::new(open_file(filename)?);
    let mut out = Vec::new();
    for (line_no, line) in f.lines().enumerate() {
        if head.is_some_and(|head| out.len() >= head) {
            break;
        }
        let line = line.with_context(|| format!("Failed to read {}", filename.display()))?;
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(9, '\t');
        let seqname = parts.next().context("Failed to find seqname")?;
        parts.next(); //consume source
        let feature = parts.next().context("Failed to find feature")?;
        if feature != feature_type {
            continue;
        }
        let start: u32 = parts
            .next()
            .context("Failed to find start")?
            .parse()
            .with_context(|| format!("Invalid start in line {}", line_no + 1))?;
        let end: u32 = parts
            .next()
            .context("Failed to find end")?
            .parse()
            .with_context(|| format!("Invalid end in line {}", line_no + 1))?;
        if start == 0 || end < start {
            bail!(
                "Invalid interval {start}-{end} in line {} of {}",
                line_no + 1,
                filename.display()
            );
        }
        parts.next(); //consume score
        let strand = Strand::from_gtf(parts.next().context("Failed to find strand")?);
        parts.next(); //consume frame
        let attributes = parts.next().context("Failed to find attributes")?;
        let gene_id = gene_id_from_attributes(attributes)
            .with_context(|| format!("No gene_id in line {} of {}", line_no + 1, filename.display()))?;
        out.push(GtfFeature {
            seqname: seqname.to_string(),
            start: start - 1,
            end,
            strand,
            gene_id: gene_id.to_string(),
        });
    }
    Ok(out)
}

/// Exon and intron interval trees sharing one gene id namespace.
#[derive(Default)]
pub struct Annotation {
    genes: Categorical,
    exons: HashMap<String, FeatureTree>,
    introns: HashMap<String, FeatureTree>,
    feature_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Exon,
    Intron,
}

impl Annotation {
    pub fn from_gtfs(
        exon_gtf: impl AsRef<Path>,
        intron_gtf: impl AsRef<Path>,
        head_features: Option<usize>,
    ) -> Result<Annotation> {
        let mut res = Annotation::default();
        let exons = read_gtf_features(exon_gtf.as_ref(), "exon", head_features)
            .context("Failed to read exon gtf")?;
        res.add(FeatureKind::Exon, exons);
        let introns = read_gtf_features(intron_gtf.as_ref(), "intron", head_features)
            .context("Failed to read intron gtf")?;
        res.add(FeatureKind::Intron, introns);
        log::info!(
            "Loaded {} features for {} genes",
            res.feature_count,
            res.genes.names().len()
        );
        Ok(res)
    }

    pub fn add(&mut self, kind: FeatureKind, features: Vec<GtfFeature>) {
        let trees = match kind {
            FeatureKind::Exon => &mut self.exons,
            FeatureKind::Intron => &mut self.introns,
        };
        for feature in features {
            if feature.start >= feature.end {
                continue;
            }
            let gene_no = self.genes.intern(&feature.gene_id);
            trees.entry(feature.seqname).or_default().insert(
                feature.start..feature.end,
                FeatureHit {
                    gene_no,
                    feature_no: self.feature_count,
                    strand: feature.strand,
                },
            );
            self.feature_count += 1;
        }
    }

    pub fn gene_id(&self, gene_no: u32) -> Option<&str> {
        self.genes.name(gene_no)
    }

    /// every feature of `kind` overlapping [start, end) on contig
    pub fn overlapping(
        &self,
        kind: FeatureKind,
        contig: &str,
        start: u32,
        end: u32,
    ) -> impl Iterator<Item = FeatureHit> + '_ {
        let trees = match kind {
            FeatureKind::Exon => &self.exons,
            FeatureKind::Intron => &self.introns,
        };
        trees
            .get(contig)
            .filter(|_| start < end)
            .into_iter()
            .flat_map(move |tree| tree.find(start..end).map(|entry| *entry.data()))
    }
}

/// Tells the partitioner where it must not split a contig.
pub trait SplitGuard: Sync {
    /// If a feature starts before `pos` and ends after it,
    /// return the largest such end.
    fn covering_end(&self, contig: &str, pos: u32) -> Option<u32>;
}

impl SplitGuard for Annotation {
    fn covering_end(&self, contig: &str, pos: u32) -> Option<u32> {
        [&self.exons, &self.introns]
            .into_iter()
            .filter_map(|trees| trees.get(contig))
            .flat_map(|tree| tree.find(pos..pos + 1))
            .filter(|entry| entry.interval().start < pos)
            .map(|entry| entry.interval().end)
            .max()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EXONS: &str = "#comment\n\
chr1\ttest\texon\t101\t200\t.\t+\t.\tgene_id \"G1\"; transcript_id \"T1\";\n\
chr1\ttest\texon\t301\t400\t.\t+\t.\tgene_id \"G1\"; transcript_id \"T1\";\n\
chr1\ttest\tgene\t101\t400\t.\t+\t.\tgene_id \"G1\";\n\
chr1\ttest\texon\t1001\t1100\t.\t-\t.\tgene_id \"G2\";\n";

    const INTRONS: &str = "chr1\ttest\tintron\t201\t300\t.\t+\t.\tgene_id \"G1\";\n";

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn test_read_features() {
        let td = tempfile::tempdir().unwrap();
        let p = write(td.path(), "exons.gtf", EXONS);
        let features = read_gtf_features(&p, "exon", None).unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(
            features[0],
            GtfFeature {
                seqname: "chr1".to_string(),
                start: 100,
                end: 200,
                strand: Strand::Plus,
                gene_id: "G1".to_string(),
            }
        );
        assert_eq!(features[2].strand, Strand::Minus);
        let head = read_gtf_features(&p, "exon", Some(1)).unwrap();
        assert_eq!(head.len(), 1);
    }

    #[test]
    fn test_annotation_lookup() {
        let td = tempfile::tempdir().unwrap();
        let exons = write(td.path(), "exons.gtf", EXONS);
        let introns = write(td.path(), "introns.gtf", INTRONS);
        let anno = Annotation::from_gtfs(&exons, &introns, None).unwrap();
        let hits: Vec<_> = anno
            .overlapping(FeatureKind::Exon, "chr1", 150, 350)
            .collect();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| anno.gene_id(h.gene_no) == Some("G1")));
        assert_ne!(hits[0].feature_no, hits[1].feature_no);
        let introns: Vec<_> = anno
            .overlapping(FeatureKind::Intron, "chr1", 250, 251)
            .collect();
        assert_eq!(introns.len(), 1);
        assert_eq!(anno.overlapping(FeatureKind::Exon, "chr2", 0, 10).count(), 0);
        assert_eq!(anno.overlapping(FeatureKind::Exon, "chr1", 10, 10).count(), 0);
    }

    #[test]
    fn test_covering_end() {
        let td = tempfile::tempdir().unwrap();
        let exons = write(td.path(), "exons.gtf", EXONS);
        let introns = write(td.path(), "introns.gtf", INTRONS);
        let anno = Annotation::from_gtfs(&exons, &introns, None).unwrap();
        assert_eq!(anno.covering_end("chr1", 150), Some(200));
        // a feature starting at pos is not cut
        assert_eq!(anno.covering_end("chr1", 100), None);
        assert_eq!(anno.covering_end("chr1", 500), None);
    }
}
