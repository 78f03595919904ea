use crate::bam_ext::BamRecordExtensions;
use bio::alignment::distance::hamming;
use rust_htslib::bam::record::Record;
use std::collections::HashMap;

/// Reads sharing this key are one molecule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MoleculeKey {
    pub sample: String,
    /// empty if the read carries no umi
    pub umi: String,
    pub reverse: bool,
    pub anchor: u32,
}

impl MoleculeKey {
    fn same_position(&self, other: &MoleculeKey) -> bool {
        self.sample == other.sample && self.reverse == other.reverse && self.anchor == other.anchor
    }
}

/// Mismatches between two umis, None if their lengths differ.
fn umi_distance(a: &str, b: &str) -> Option<u64> {
    (a.len() == b.len()).then(|| hamming(a.as_bytes(), b.as_bytes()))
}

/// Molecule state that can take over the reads of another molecule.
pub trait Collapse {
    fn absorb(&mut self, other: Self);
}

impl<T> Collapse for Vec<T> {
    fn absorb(&mut self, other: Vec<T>) {
        self.extend(other);
    }
}

/// Which tags identify a molecule.
#[derive(Debug, Clone, Copy)]
pub struct MoleculeTags {
    pub sample: [u8; 2],
    pub umi: [u8; 2],
    pub site: [u8; 2],
}

impl MoleculeTags {
    /// The coordinate that decides the partition of a read:
    /// the site tag if present, otherwise the start of the fragment,
    /// so both mates of a pair end up in the same molecule.
    pub fn anchor(&self, read: &Record) -> Option<u32> {
        let pos = read
            .int_tag(&self.site)
            .unwrap_or_else(|| read.fragment_start());
        u32::try_from(pos).ok()
    }

    pub fn sample<'a>(&self, read: &'a Record) -> Option<&'a str> {
        read.str_tag(&self.sample).filter(|s| !s.is_empty())
    }

    pub fn key(&self, read: &Record, sample: &str, anchor: u32) -> MoleculeKey {
        MoleculeKey {
            sample: sample.to_string(),
            umi: read.str_tag(&self.umi).unwrap_or("").to_string(),
            reverse: read.fragment_is_reverse(),
            anchor,
        }
    }
}

/// Molecule state `M` collected per key, plus how many reads went in.
pub struct Molecules<M> {
    groups: HashMap<MoleculeKey, (M, u32)>,
}

impl<M: Default> Default for Molecules<M> {
    fn default() -> Self {
        Molecules {
            groups: HashMap::new(),
        }
    }
}

impl<M: Default> Molecules<M> {
    /// The state for key, counting one more read for it.
    pub fn read_for(&mut self, key: MoleculeKey) -> &mut M {
        let entry = self.groups.entry(key).or_default();
        entry.1 += 1;
        &mut entry.0
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// (key, state, read count), ordered by key.
    ///
    /// Molecules at the same position whose umis differ in at most
    /// `max_umi_distance` bases are merged into the one with the most reads.
    pub fn into_sorted(self, max_umi_distance: u32) -> Vec<(MoleculeKey, M, u32)>
    where
        M: Collapse,
    {
        let mut res: Vec<_> = self
            .groups
            .into_iter()
            .map(|(key, (molecule, reads))| (key, molecule, reads))
            .collect();
        if max_umi_distance > 0 {
            res = collapse_umis(res, max_umi_distance);
        }
        res.sort_by(|a, b| a.0.cmp(&b.0));
        res
    }
}

fn collapse_umis<M: Collapse>(
    mut molecules: Vec<(MoleculeKey, M, u32)>,
    max_distance: u32,
) -> Vec<(MoleculeKey, M, u32)> {
    // one position after the other, most reads first
    molecules.sort_by(|a, b| {
        (&a.0.sample, a.0.reverse, a.0.anchor)
            .cmp(&(&b.0.sample, b.0.reverse, b.0.anchor))
            .then(b.2.cmp(&a.2))
            .then_with(|| a.0.umi.cmp(&b.0.umi))
    });
    let mut res: Vec<(MoleculeKey, M, u32)> = Vec::with_capacity(molecules.len());
    let mut position_start = 0;
    for (key, molecule, reads) in molecules {
        if res
            .get(position_start)
            .is_some_and(|(first, _, _)| !first.same_position(&key))
        {
            position_start = res.len();
        }
        let parent = res[position_start..].iter_mut().find(|(parent, _, _)| {
            umi_distance(&parent.umi, &key.umi).is_some_and(|d| d <= max_distance as u64)
        });
        match parent {
            Some((_, parent_molecule, parent_reads)) => {
                parent_molecule.absorb(molecule);
                *parent_reads += reads;
            }
            None => res.push((key, molecule, reads)),
        }
    }
    res
}
