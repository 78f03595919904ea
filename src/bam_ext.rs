use rust_htslib::bam::record::{Aux, Record};

pub trait BamRecordExtensions {
    /// A string valued aux tag, None if absent or of another type.
    fn str_tag(&self, tag: &[u8; 2]) -> Option<&str>;

    /// An integer valued aux tag, whatever width it was stored with.
    fn int_tag(&self, tag: &[u8; 2]) -> Option<i64>;

    /// Strand of the sequenced fragment.
    /// The second read of a pair reports the opposite strand.
    fn fragment_is_reverse(&self) -> bool;

    fn is_read1_or_unpaired(&self) -> bool;

    /// Leftmost start of the fragment: the smaller of both mates' positions
    /// when the mate aligned to the same contig, otherwise the read's own.
    fn fragment_start(&self) -> i64;

    /// [start, end) reference intervals of the aligned (M/=/X) blocks.
    fn reference_blocks(&self) -> Vec<(u32, u32)>;
}

impl BamRecordExtensions for Record {
    fn str_tag(&self, tag: &[u8; 2]) -> Option<&str> {
        match self.aux(tag) {
            Ok(Aux::String(value)) => Some(value),
            _ => None,
        }
    }

    fn int_tag(&self, tag: &[u8; 2]) -> Option<i64> {
        Some(match self.aux(tag).ok()? {
            Aux::I8(value) => value as i64,
            Aux::I16(value) => value as i64,
            Aux::I32(value) => value as i64,
            Aux::U8(value) => value as i64,
            Aux::U16(value) => value as i64,
            Aux::U32(value) => value as i64,
            _ => return None,
        })
    }

    fn fragment_is_reverse(&self) -> bool {
        if self.is_paired() && self.is_last_in_template() {
            !self.is_reverse()
        } else {
            self.is_reverse()
        }
    }

    fn is_read1_or_unpaired(&self) -> bool {
        !self.is_paired() || self.is_first_in_template()
    }

    fn fragment_start(&self) -> i64 {
        if self.is_paired()
            && !self.is_mate_unmapped()
            && self.mtid() == self.tid()
            && self.mpos() >= 0
        {
            self.pos().min(self.mpos())
        } else {
            self.pos()
        }
    }

    fn reference_blocks(&self) -> Vec<(u32, u32)> {
        use rust_htslib::bam::ext::BamRecordExtensions as _;
        self.aligned_blocks()
            .filter(|[start, end]| *start >= 0 && end > start)
            .map(|[start, end]| (start as u32, end as u32))
            .collect()
    }
}
