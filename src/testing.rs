//! Small synthetic BAM files for the test suites.
use anyhow::{Context, Result, bail};
use rust_htslib::bam::{
    self,
    header::{Header, HeaderRecord},
    record::{Aux, Cigar, CigarString},
};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct TestRead {
    qname: String,
    tid: i32,
    pos: i64,
    cigar: Option<Vec<Cigar>>,
    seq: Option<Vec<u8>>,
    flags: u16,
    mapq: u8,
    /// (tid, pos) of the mate
    mate: Option<(i32, i64)>,
    string_tags: Vec<([u8; 2], String)>,
    int_tags: Vec<([u8; 2], i32)>,
}

impl TestRead {
    pub fn new(qname: &str, tid: i32, pos: i64) -> TestRead {
        TestRead {
            qname: qname.to_string(),
            tid,
            pos,
            cigar: None,
            seq: None,
            flags: 0,
            mapq: 60,
            mate: None,
            string_tags: Vec::new(),
            int_tags: Vec::new(),
        }
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn mapq(mut self, mapq: u8) -> Self {
        self.mapq = mapq;
        self
    }

    pub fn mate(mut self, tid: i32, pos: i64) -> Self {
        self.mate = Some((tid, pos));
        self
    }

    pub fn cigar(mut self, cigar: Vec<Cigar>) -> Self {
        self.cigar = Some(cigar);
        self
    }

    pub fn seq(mut self, seq: &str) -> Self {
        self.seq = Some(seq.as_bytes().to_vec());
        self
    }

    pub fn tag(mut self, tag: &[u8; 2], value: &str) -> Self {
        self.string_tags.push((*tag, value.to_string()));
        self
    }

    pub fn int_tag(mut self, tag: &[u8; 2], value: i32) -> Self {
        self.int_tags.push((*tag, value));
        self
    }

    pub fn sample(self, sample: &str) -> Self {
        self.tag(b"SM", sample)
    }

    pub fn umi(self, umi: &str) -> Self {
        self.tag(b"RX", umi)
    }

    pub fn site(self, site: i32) -> Self {
        self.int_tag(b"DS", site)
    }

    /// Bismark methylation string. Also sets the sequence length
    /// (and a plain match cigar, unless one was given).
    pub fn xm(mut self, calls: &str) -> Self {
        if self.seq.is_none() {
            self.seq = Some(vec![b'C'; calls.len()]);
        }
        self.tag(b"XM", calls)
    }

    fn query_length(cigar: &[Cigar]) -> u32 {
        cigar
            .iter()
            .map(|op| match op {
                Cigar::Match(l)
                | Cigar::Ins(l)
                | Cigar::SoftClip(l)
                | Cigar::Equal(l)
                | Cigar::Diff(l) => *l,
                _ => 0,
            })
            .sum()
    }

    pub fn record(&self) -> Result<bam::Record> {
        let seq = match (&self.seq, &self.cigar) {
            (Some(seq), _) => seq.clone(),
            (None, Some(cigar)) => vec![b'A'; Self::query_length(cigar) as usize],
            (None, None) => vec![b'A'; 20],
        };
        let cigar = match &self.cigar {
            Some(cigar) => cigar.clone(),
            None => vec![Cigar::Match(seq.len() as u32)],
        };
        if Self::query_length(&cigar) as usize != seq.len() {
            bail!("cigar and sequence length of {} disagree", self.qname);
        }
        let mut record = bam::Record::new();
        record.set(
            self.qname.as_bytes(),
            Some(&CigarString(cigar)),
            &seq,
            &vec![30; seq.len()],
        );
        record.set_tid(self.tid);
        record.set_pos(self.pos);
        let (mtid, mpos) = self.mate.unwrap_or((-1, -1));
        record.set_mtid(mtid);
        record.set_mpos(mpos);
        record.set_mapq(self.mapq);
        record.set_flags(self.flags);
        let end = rust_htslib::bam::ext::BamRecordExtensions::reference_end(&record);
        record.set_bin(reg2bin(self.pos, end.max(self.pos + 1)));
        for (tag, value) in self.string_tags.iter() {
            record
                .push_aux(tag, Aux::String(value))
                .with_context(|| format!("Failed to add tag to {}", self.qname))?;
        }
        for (tag, value) in self.int_tags.iter() {
            record
                .push_aux(tag, Aux::I32(*value))
                .with_context(|| format!("Failed to add tag to {}", self.qname))?;
        }
        Ok(record)
    }
}

/// UCSC binning scheme, as stored in the BAM record.
fn reg2bin(beg: i64, end: i64) -> u16 {
    let end = end - 1;
    for (shift, offset) in [(14, 4681), (17, 585), (20, 73), (23, 9), (26, 1)] {
        if beg >> shift == end >> shift {
            return (offset + (beg >> shift)) as u16;
        }
    }
    0
}

/// Write a coordinate sorted, indexed BAM file.
pub fn write_bam(path: &Path, contigs: &[(&str, u32)], reads: &[TestRead]) -> Result<()> {
    let mut header = Header::new();
    header.push_record(
        HeaderRecord::new(b"HD")
            .push_tag(b"VN", &"1.6")
            .push_tag(b"SO", &"coordinate"),
    );
    for (name, length) in contigs {
        header.push_record(
            HeaderRecord::new(b"SQ")
                .push_tag(b"SN", name)
                .push_tag(b"LN", length),
        );
    }
    let mut records = reads
        .iter()
        .map(|r| r.record())
        .collect::<Result<Vec<_>>>()?;
    records.sort_by_key(|r| (r.tid(), r.pos()));
    {
        let mut writer = bam::Writer::from_path(path, &header, bam::Format::Bam)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        for record in records.iter() {
            writer.write(record).context("Failed to write test record")?;
        }
    }
    bam::index::build(path, None, bam::index::Type::Bai, 1)
        .with_context(|| format!("Failed to index {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_htslib::bam::Read;

    #[test]
    fn test_reg2bin() {
        assert_eq!(reg2bin(0, 1), 4681);
        assert_eq!(reg2bin(16383, 16385), 585);
        assert_eq!(reg2bin(0, 1 << 29), 0);
    }

    #[test]
    fn test_write_bam() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("test.bam");
        write_bam(
            &path,
            &[("chr1", 1000), ("chr2", 500)],
            &[
                TestRead::new("b", 0, 300).sample("A"),
                TestRead::new("a", 0, 100).sample("A").site(90),
                TestRead::new("c", 1, 10).xm("..Z.."),
            ],
        )
        .unwrap();
        let mut bam = bam::IndexedReader::from_path(&path).unwrap();
        bam.fetch((0u32, 0u64, 1000u64)).unwrap();
        let names: Vec<_> = bam
            .records()
            .map(|r| String::from_utf8(r.unwrap().qname().to_vec()).unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        bam.fetch((1u32, 0u64, 500u64)).unwrap();
        let r = bam.records().next().unwrap().unwrap();
        assert_eq!(r.seq_len(), 5);
    }

    #[test]
    fn test_cigar_length_mismatch() {
        let td = tempfile::tempdir().unwrap();
        let read = TestRead::new("x", 0, 1).seq("ACGT").cigar(vec![Cigar::Match(5)]);
        assert!(write_bam(&td.path().join("x.bam"), &[("chr1", 100)], &[read]).is_err());
    }
}
