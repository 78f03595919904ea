use anyhow::{Context, Result, bail};
use rust_htslib::bam::{self, Read as _};
use std::collections::{HashMap, HashSet};
use flate2::write::GzEncoder;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub fn open_file(filename: impl AsRef<Path>) -> Result<Box<dyn Read + Send>> {
    let fh = ex::fs::File::open(filename.as_ref())
        .context(format!("Could not open file {:?}", filename.as_ref()))?;
    let wrapped = niffler::send::get_reader(Box::new(fh))?;
    Ok(wrapped.0)
}

/// An output file, gzip compressed if the name ends in .gz.
/// Dropping it without [`OutputFile::finish`] loses write errors.
pub enum OutputFile {
    Plain(BufWriter<ex::fs::File>),
    Gzip(GzEncoder<BufWriter<ex::fs::File>>),
}

impl OutputFile {
    /// Write the gzip trailer (if any) and flush everything to disk.
    pub fn finish(self) -> Result<()> {
        let mut inner = match self {
            OutputFile::Plain(inner) => inner,
            OutputFile::Gzip(encoder) => encoder.finish().context("Failed to finish gzip stream")?,
        };
        inner.flush().context("Failed to flush output file")?;
        Ok(())
    }
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            OutputFile::Plain(inner) => inner.write(buf),
            OutputFile::Gzip(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            OutputFile::Plain(inner) => inner.flush(),
            OutputFile::Gzip(inner) => inner.flush(),
        }
    }
}

/// Create an output file (and its parent directories).
pub fn create_file(filename: impl AsRef<Path>) -> Result<OutputFile> {
    let filename = filename.as_ref();
    if let Some(parent) = filename.parent() {
        if !parent.as_os_str().is_empty() {
            ex::fs::create_dir_all(parent)?;
        }
    }
    let fh = ex::fs::File::create(filename)?;
    let buffered = BufWriter::new(fh);
    if filename.extension().is_some_and(|ext| ext == "gz") {
        Ok(OutputFile::Gzip(GzEncoder::new(
            buffered,
            flate2::Compression::default(),
        )))
    } else {
        Ok(OutputFile::Plain(buffered))
    }
}

pub fn open_indexed_bam(filename: impl AsRef<Path>) -> Result<bam::IndexedReader> {
    bam::IndexedReader::from_path(filename.as_ref()).with_context(|| {
        format!(
            "Failed to open bam file {} (with index)",
            filename.as_ref().display()
        )
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContigInfo {
    pub name: String,
    pub tid: u32,
    pub length: u32,
    /// None if the index carries no statistics (e.g. some csi indices)
    pub mapped_reads: Option<u64>,
}

/// Contigs in header order, with mapped read counts from the index if available.
pub fn contigs_from_bam(bam: &mut bam::IndexedReader) -> Result<Vec<ContigInfo>> {
    let mapped: HashMap<u32, u64> = match bam.index_stats() {
        Ok(stats) => stats
            .into_iter()
            .filter(|(tid, _, _, _)| *tid >= 0)
            .map(|(tid, _length, mapped_count, _unmapped_count)| (tid as u32, mapped_count))
            .collect(),
        Err(e) => {
            log::debug!("No index statistics available: {e}");
            HashMap::new()
        }
    };
    let header = bam.header();
    let mut res = Vec::new();
    for (tid, name) in header.target_names().iter().enumerate() {
        let tid = tid as u32;
        let name = std::str::from_utf8(name)
            .context("Reference name wasn't utf-8")?
            .to_string();
        let length = header
            .target_len(tid)
            .with_context(|| format!("No length for reference {name}"))?;
        let length = u32::try_from(length)
            .with_context(|| format!("Reference {name} is longer than u32::MAX"))?;
        res.push(ContigInfo {
            name,
            tid,
            length,
            mapped_reads: mapped.get(&tid).copied(),
        });
    }
    Ok(res)
}

/// Positions (contig, 0-based) that must not contribute methylation calls.
#[derive(Debug, Default, Clone)]
pub struct KnownVariants {
    by_contig: HashMap<String, HashSet<u32>>,
}

impl KnownVariants {
    pub fn contains(&self, contig: &str, pos: u32) -> bool {
        self.by_contig
            .get(contig)
            .is_some_and(|positions| positions.contains(&pos))
    }

    pub fn len(&self) -> usize {
        self.by_contig.values().map(|x| x.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&mut self, contig: &str, pos: u32) {
        self.by_contig
            .entry(contig.to_string())
            .or_default()
            .insert(pos);
    }
}

/// Read CHROM / POS out of a (possibly compressed) VCF.
pub fn read_known_variants(filename: impl AsRef<Path>) -> Result<KnownVariants> {
    let filename = filename.as_ref();
    let reader = BufReader::new(open_file(filename)?);
    let mut res = KnownVariants::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", filename.display()))?;
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, '\t');
        let contig = parts.next().context("Failed to find CHROM")?;
        let pos = parts.next().with_context(|| {
            format!("No POS column in line {} of {}", line_no + 1, filename.display())
        })?;
        let pos: u32 = pos.parse().with_context(|| {
            format!("Invalid POS '{pos}' in line {} of {}", line_no + 1, filename.display())
        })?;
        if pos == 0 {
            bail!("VCF positions are 1-based, found 0 in line {}", line_no + 1);
        }
        res.insert(contig, pos - 1);
    }
    Ok(res)
}
