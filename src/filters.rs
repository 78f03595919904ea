use crate::bam_ext::BamRecordExtensions;
use anyhow::{Result, bail};
use enum_dispatch::enum_dispatch;
use rust_htslib::bam::record::Record;

#[derive(serde::Deserialize, Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub enum KeepOrRemove {
    #[serde(alias = "keep")]
    Keep,
    #[serde(alias = "remove")]
    Remove,
}

#[enum_dispatch(Filter)]
pub trait ReadFilter: Send + Sync {
    fn remove_read(&self, read: &Record) -> Result<bool>;
}

/// Optional filters on top of the fixed [filter] settings.
#[derive(serde::Deserialize, Debug, Clone, strum_macros::Display, serde::Serialize)]
#[serde(tag = "mode")]
#[enum_dispatch]
pub enum Filter {
    #[serde(alias = "multimapper")]
    MultiMapper(MultiMapper),
}

#[derive(serde::Deserialize, Debug, Clone, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct MultiMapper {
    pub action: KeepOrRemove,
}

fn number_of_hits(read: &Record) -> Result<i64> {
    match read.int_tag(b"NH") {
        Some(hits) => Ok(hits),
        None => bail!(
            "read {} had no NH tag (or it wasn't an integer). Can't filter multi mappers.",
            String::from_utf8_lossy(read.qname())
        ),
    }
}

impl ReadFilter for MultiMapper {
    fn remove_read(&self, read: &Record) -> Result<bool> {
        let hit = number_of_hits(read)? > 1;
        Ok(match self.action {
            KeepOrRemove::Keep => !hit,
            KeepOrRemove::Remove => hit,
        })
    }
}

/// Why a record did not make it into a molecule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Rejection {
    #[strum(serialize = "unmapped_or_secondary")]
    UnmappedOrSecondary,
    #[strum(serialize = "low_mapping_quality")]
    LowMappingQuality,
    #[strum(serialize = "duplicate")]
    Duplicate,
    #[strum(serialize = "filtered")]
    Filtered,
    #[strum(serialize = "no_sample_tag")]
    NoSample,
}

/// The per-job read filters every assay applies before classification.
#[derive(Debug, Clone)]
pub struct ReadFilters {
    pub min_mapping_quality: u8,
    pub dedup: bool,
    pub extra: Vec<Filter>,
}

impl ReadFilters {
    pub fn check(&self, read: &Record) -> Result<Option<Rejection>> {
        if read.is_unmapped()
            || read.is_secondary()
            || read.is_supplementary()
            || read.is_quality_check_failed()
        {
            return Ok(Some(Rejection::UnmappedOrSecondary));
        }
        if read.mapq() < self.min_mapping_quality {
            return Ok(Some(Rejection::LowMappingQuality));
        }
        if self.dedup && read.is_duplicate() {
            return Ok(Some(Rejection::Duplicate));
        }
        for f in self.extra.iter() {
            if f.remove_read(read)? {
                return Ok(Some(Rejection::Filtered));
            }
        }
        Ok(None)
    }
}
