use crate::config::Partitioning;
use crate::gtf::SplitGuard;
use crate::io::ContigInfo;
use anyhow::{Result, bail};

/// One unit of parallel work: a coordinate range on one contig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub id: usize,
    pub contig: String,
    pub tid: u32,
    pub start: u32,
    pub end: u32,
    /// size of the column bins (only the methylation counter cares)
    pub bin_size: u32,
}

impl Partition {
    pub fn str_id(&self) -> String {
        format!("{}:{}-{}", self.contig, self.start, self.end)
    }

    pub fn contains(&self, pos: u32) -> bool {
        self.start <= pos && pos < self.end
    }
}

/// How many bases one partition spans, or None for 'whole contig'.
fn span(config: &Partitioning) -> Result<Option<u32>> {
    if config.bin_size == 0 {
        bail!("bin_size must be positive");
    }
    let Some(bp_per_job) = config.bp_per_job else {
        return Ok(None);
    };
    if bp_per_job == 0 {
        bail!("bp_per_job must be positive");
    }
    if config.bin_size == 1 {
        //single base resolution - chunk by basepairs directly
        return Ok(Some(bp_per_job));
    }
    let bins_per_job = bp_per_job / config.bin_size;
    if bins_per_job == 0 {
        bail!(
            "bp_per_job ({}) must be at least bin_size ({})",
            bp_per_job,
            config.bin_size
        );
    }
    Ok(Some(bins_per_job * config.bin_size))
}

fn keep_contig(contig: &ContigInfo, config: &Partitioning) -> bool {
    if let Some(allowed) = config.contigs.as_ref() {
        if !allowed.contains(&contig.name) {
            return false;
        }
    }
    if config.skip_contigs.contains(&contig.name) {
        log::debug!("Skipping contig {} (skip list)", contig.name);
        return false;
    }
    if config
        .skip_contig_patterns
        .iter()
        .any(|re| re.is_match(&contig.name))
    {
        log::debug!("Skipping contig {} (skip pattern)", contig.name);
        return false;
    }
    if contig.mapped_reads == Some(0) || contig.length == 0 {
        return false;
    }
    true
}

/// Split the genome into partitions.
///
/// Contigs are visited in header order, each one is covered exactly once
/// by consecutive, non overlapping partitions whose boundaries fall on bin
/// boundaries. If a `guard` is passed, a boundary that would cut one of its
/// features is moved right to the end of that feature.
pub fn generate_partitions(
    contigs: &[ContigInfo],
    config: &Partitioning,
    guard: Option<&dyn SplitGuard>,
) -> Result<Vec<Partition>> {
    let span = span(config)?;
    if let Some(allowed) = config.contigs.as_ref() {
        for name in allowed {
            if !contigs.iter().any(|c| &c.name == name) {
                bail!("Contig {} requested, but not present in the bam file", name);
            }
        }
    }
    for name in config.skip_contigs.iter() {
        if !contigs.iter().any(|c| &c.name == name) {
            log::debug!("Skip-listed contig {} is not in the bam file", name);
        }
    }

    let mut res = Vec::new();
    'outer: for contig in contigs.iter().filter(|c| keep_contig(c, config)) {
        let mut start = 0;
        while start < contig.length {
            if config.head.is_some_and(|head| res.len() >= head) {
                break 'outer;
            }
            let mut end = match span {
                Some(span) => start.saturating_add(span).min(contig.length),
                None => contig.length,
            };
            if let Some(guard) = guard {
                //don't cut features in half
                while end < contig.length {
                    match guard.covering_end(&contig.name, end) {
                        Some(feature_end) if feature_end > end => {
                            end = feature_end.min(contig.length);
                        }
                        _ => break,
                    }
                }
            }
            res.push(Partition {
                id: res.len(),
                contig: contig.name.clone(),
                tid: contig.tid,
                start,
                end,
                bin_size: config.bin_size,
            });
            start = end;
        }
    }
    if res.is_empty() {
        bail!(
            "No partitions generated. Either the bam file has no mapped reads, or all contigs were skipped."
        );
    }
    Ok(res)
}

#[cfg(test)]
mod test {
    use super::*;

    fn contigs() -> Vec<ContigInfo> {
        vec![
            ContigInfo {
                name: "chr1".to_string(),
                tid: 0,
                length: 2500,
                mapped_reads: Some(10),
            },
            ContigInfo {
                name: "chr2".to_string(),
                tid: 1,
                length: 1000,
                mapped_reads: None,
            },
            ContigInfo {
                name: "chrM".to_string(),
                tid: 2,
                length: 100,
                mapped_reads: Some(5),
            },
            ContigInfo {
                name: "chrEmpty".to_string(),
                tid: 3,
                length: 100,
                mapped_reads: Some(0),
            },
        ]
    }

    fn config(bin_size: u32, bp_per_job: Option<u32>) -> Partitioning {
        Partitioning {
            bin_size,
            bp_per_job,
            skip_contigs: vec!["chrM".to_string()],
            ..Default::default()
        }
    }

    fn assert_covers_exactly(parts: &[Partition], contig: &ContigInfo) {
        let mine: Vec<_> = parts.iter().filter(|p| p.contig == contig.name).collect();
        assert_eq!(mine.first().unwrap().start, 0);
        assert_eq!(mine.last().unwrap().end, contig.length);
        for (a, b) in mine.iter().zip(mine.iter().skip(1)) {
            assert_eq!(a.end, b.start);
        }
    }

    #[test]
    fn test_bins_per_job() {
        let parts = generate_partitions(&contigs(), &config(500, Some(1100)), None).unwrap();
        // 1100 bp -> 2 bins of 500 per job
        let chr1: Vec<_> = parts
            .iter()
            .filter(|p| p.contig == "chr1")
            .map(|p| (p.start, p.end))
            .collect();
        assert_eq!(chr1, vec![(0, 1000), (1000, 2000), (2000, 2500)]);
        assert_covers_exactly(&parts, &contigs()[0]);
        assert_covers_exactly(&parts, &contigs()[1]);
        assert!(parts.iter().all(|p| p.contig != "chrM"));
        assert!(parts.iter().all(|p| p.contig != "chrEmpty"));
        for (ii, p) in parts.iter().enumerate() {
            assert_eq!(p.id, ii);
            assert_eq!(p.bin_size, 500);
        }
    }

    #[test]
    fn test_single_base_resolution() {
        let parts = generate_partitions(&contigs(), &config(1, Some(700)), None).unwrap();
        let chr2: Vec<_> = parts
            .iter()
            .filter(|p| p.contig == "chr2")
            .map(|p| (p.start, p.end))
            .collect();
        assert_eq!(chr2, vec![(0, 700), (700, 1000)]);
        assert!(parts.iter().all(|p| p.bin_size == 1));
    }

    #[test]
    fn test_whole_contigs() {
        let parts = generate_partitions(&contigs(), &config(500, None), None).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].str_id(), "chr1:0-2500");
        assert_eq!(parts[1].str_id(), "chr2:0-1000");
    }

    #[test]
    fn test_head_limits_partitions() {
        let mut c = config(500, Some(500));
        c.head = Some(3);
        let parts = generate_partitions(&contigs(), &c, None).unwrap();
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_skip_patterns_and_allow_list() {
        let mut c = config(500, None);
        c.skip_contig_patterns = vec![regex::Regex::new("^chr2$").unwrap()];
        let parts = generate_partitions(&contigs(), &c, None).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].contig, "chr1");

        let mut c = config(500, None);
        c.contigs = Some(vec!["chr2".to_string()]);
        let parts = generate_partitions(&contigs(), &c, None).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].contig, "chr2");

        c.contigs = Some(vec!["chrX".to_string()]);
        assert!(generate_partitions(&contigs(), &c, None).is_err());
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(generate_partitions(&contigs(), &config(0, Some(100)), None).is_err());
        assert!(generate_partitions(&contigs(), &config(500, Some(0)), None).is_err());
        assert!(generate_partitions(&contigs(), &config(500, Some(499)), None).is_err());
    }

    #[test]
    fn test_nothing_left() {
        let mut c = config(500, None);
        c.contigs = Some(vec!["chrM".to_string()]);
        assert!(generate_partitions(&contigs(), &c, None).is_err());
    }

    struct Feature(u32, u32);
    impl SplitGuard for Feature {
        fn covering_end(&self, _contig: &str, pos: u32) -> Option<u32> {
            (self.0 < pos && pos < self.1).then_some(self.1)
        }
    }

    #[test]
    fn test_guard_moves_boundaries() {
        let guard = Feature(900, 1234);
        let parts =
            generate_partitions(&contigs(), &config(500, Some(1000)), Some(&guard)).unwrap();
        let chr1: Vec<_> = parts
            .iter()
            .filter(|p| p.contig == "chr1")
            .map(|p| (p.start, p.end))
            .collect();
        assert_eq!(chr1, vec![(0, 1234), (1234, 2234), (2234, 2500)]);
        assert_covers_exactly(&parts, &contigs()[0]);
    }
}
