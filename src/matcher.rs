use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::categorize::SampleId;
use crate::cells::CalledBarcodes;

/// Bases substituted when generating corrected barcodes.
pub const ALPHABET: [u8; 4] = *b"ACGT";

/// Owner of a corrected barcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Sample(SampleId),
    /// Reachable from called barcodes of more than one sample.
    Ambiguous,
}

/// Outcome of looking up an observed barcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Equal to a called barcode.
    Exact(SampleId),
    /// One substitution away from a called barcode of exactly one sample.
    Corrected(SampleId),
    Ambiguous,
    Unmatched,
}

impl Resolution {
    #[inline]
    pub fn sample(self) -> Option<SampleId> {
        match self {
            Resolution::Exact(id) | Resolution::Corrected(id) => Some(id),
            Resolution::Ambiguous | Resolution::Unmatched => None,
        }
    }
}

/// Single-substitution variants of called barcodes mapped to their owning
/// sample. Once an entry is [`Assignment::Ambiguous`] it never changes again.
#[derive(Debug, Default)]
pub struct NeighborMap {
    map: FxHashMap<Vec<u8>, Assignment>,
}

impl NeighborMap {
    /// Variants of every called barcode, leaving out the `exact` ones.
    pub fn build(called: &CalledBarcodes, exact: &FxHashMap<Vec<u8>, SampleId>) -> Self {
        let mut map = Self::default();
        for (sample, barcode) in called.iter() {
            map.add_variants(barcode, sample, exact);
        }
        map
    }

    /// Record `variant` as reachable from a barcode of `sample`.
    pub fn insert(&mut self, variant: &[u8], sample: SampleId) {
        match self.map.get_mut(variant) {
            None => {
                self.map.insert(variant.to_vec(), Assignment::Sample(sample));
            }
            Some(entry) => {
                if let Assignment::Sample(owner) = *entry {
                    if owner != sample {
                        *entry = Assignment::Ambiguous;
                    }
                }
            }
        }
    }

    /// Force `barcode` to be ambiguous.
    pub fn mark_ambiguous(&mut self, barcode: &[u8]) {
        self.map.insert(barcode.to_vec(), Assignment::Ambiguous);
    }

    /// Insert every single-substitution variant of `barcode` that is not
    /// itself an exact called barcode.
    pub fn add_variants(&mut self, barcode: &[u8], sample: SampleId, exact: &FxHashMap<Vec<u8>, SampleId>) {
        let mut variant = barcode.to_vec();
        for pos in 0..barcode.len() {
            let original = barcode[pos];
            for &base in ALPHABET.iter().filter(|&&b| b != original) {
                variant[pos] = base;
                if !exact.contains_key(variant.as_slice()) {
                    self.insert(&variant, sample);
                }
            }
            variant[pos] = original;
        }
    }

    #[inline]
    pub fn get(&self, barcode: &[u8]) -> Option<Assignment> {
        self.map.get(barcode).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn num_ambiguous(&self) -> usize {
        self.map.values().filter(|a| **a == Assignment::Ambiguous).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Assignment)> {
        self.map.iter().map(|(k, v)| (k.as_slice(), *v))
    }
}

/// Exact and corrected barcode lookup for one library.
#[derive(Debug, Default)]
pub struct BarcodeResolver {
    exact: FxHashMap<Vec<u8>, SampleId>,
    neighbors: NeighborMap,
    conflicts: usize,
}

impl BarcodeResolver {
    /// Build both tables from the called barcodes. A barcode called in more
    /// than one sample is not an exact match for any of them and resolves as
    /// ambiguous.
    pub fn from_called(called: &CalledBarcodes) -> Self {
        let mut exact: FxHashMap<Vec<u8>, SampleId> = FxHashMap::default();
        let mut conflicted: FxHashSet<Vec<u8>> = FxHashSet::default();
        for (sample, barcode) in called.iter() {
            match exact.get(barcode) {
                None => {
                    exact.insert(barcode.to_vec(), sample);
                }
                Some(&owner) if owner != sample => {
                    conflicted.insert(barcode.to_vec());
                }
                Some(_) => {}
            }
        }
        for barcode in &conflicted {
            warn!("Barcode {} was called in more than one sample", String::from_utf8_lossy(barcode));
            exact.remove(barcode);
        }

        let mut neighbors = NeighborMap::build(called, &exact);
        for barcode in &conflicted {
            neighbors.mark_ambiguous(barcode);
        }
        debug!(
            "Barcode lookup: {} exact, {} corrected ({} ambiguous)",
            exact.len(),
            neighbors.len(),
            neighbors.num_ambiguous()
        );

        Self { exact, neighbors, conflicts: conflicted.len() }
    }

    /// Exact table first, then the neighbor table. Barcodes of a different
    /// length than the called ones simply do not match.
    #[inline]
    pub fn resolve(&self, barcode: &[u8]) -> Resolution {
        if let Some(&sample) = self.exact.get(barcode) {
            return Resolution::Exact(sample);
        }
        match self.neighbors.get(barcode) {
            Some(Assignment::Sample(sample)) => Resolution::Corrected(sample),
            Some(Assignment::Ambiguous) => Resolution::Ambiguous,
            None => Resolution::Unmatched,
        }
    }

    pub fn num_exact(&self) -> usize {
        self.exact.len()
    }

    /// Barcodes that were called in more than one sample.
    pub fn num_conflicts(&self) -> usize {
        self.conflicts
    }

    pub fn neighbors(&self) -> &NeighborMap {
        &self.neighbors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hamming_distance(a: &[u8], b: &[u8]) -> Option<usize> {
        if a.len() != b.len() {
            return None;
        }
        Some(a.iter().zip(b).filter(|(x, y)| x != y).count())
    }

    fn called(per_sample: &[&[&str]]) -> CalledBarcodes {
        CalledBarcodes::from_samples(
            per_sample.iter().map(|bcs| bcs.iter().map(|b| b.as_bytes().to_vec()).collect()).collect(),
        )
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(b"ACGT", b"ACGT"), Some(0));
        assert_eq!(hamming_distance(b"ACGT", b"ACCT"), Some(1));
        assert_eq!(hamming_distance(b"ACGT", b"TGCA"), Some(4));
        assert_eq!(hamming_distance(b"ACGT", b"ACG"), None);
    }

    #[test]
    fn test_single_barcode_has_three_variants_per_base() {
        let resolver = BarcodeResolver::from_called(&called(&[&["ACGTAC"]]));
        assert_eq!(resolver.neighbors().len(), 18);
        assert_eq!(resolver.neighbors().num_ambiguous(), 0);
    }

    #[test]
    fn test_neighbors_are_one_substitution_from_a_called_barcode() {
        let calls = called(&[&["AAAA", "ACGT", "GGTC"], &["AACA", "TTTT"]]);
        let resolver = BarcodeResolver::from_called(&calls);
        for (variant, assignment) in resolver.neighbors().iter() {
            let sources: Vec<SampleId> = calls
                .iter()
                .filter(|(_, bc)| hamming_distance(bc, variant) == Some(1))
                .map(|(id, _)| id)
                .collect();
            assert!(!sources.is_empty());
            match assignment {
                Assignment::Sample(id) => assert!(sources.iter().all(|s| *s == id)),
                Assignment::Ambiguous => assert!(sources.iter().any(|s| *s != sources[0])),
            }
        }
    }

    #[test]
    fn test_two_sample_conflict_is_ambiguous() {
        // AAAA (s1) and AACA (s2) differ at position 3; AAGA and AATA are
        // one substitution from both.
        let resolver = BarcodeResolver::from_called(&called(&[&["AAAA"], &["AACA"]]));
        assert_eq!(resolver.resolve(b"AATA"), Resolution::Ambiguous);
        assert_eq!(resolver.resolve(b"AAGA"), Resolution::Ambiguous);
        assert_eq!(resolver.resolve(b"CAAA"), Resolution::Corrected(0));
        assert_eq!(resolver.resolve(b"AACC"), Resolution::Corrected(1));
        assert_eq!(resolver.neighbors().num_ambiguous(), 2);
    }

    #[test]
    fn test_exact_match_wins_over_neighbor() {
        let resolver = BarcodeResolver::from_called(&called(&[&["AAAA"], &["AACA"]]));
        assert_eq!(resolver.resolve(b"AAAA"), Resolution::Exact(0));
        assert_eq!(resolver.resolve(b"AACA"), Resolution::Exact(1));
        assert_eq!(resolver.neighbors().get(b"AACA"), None);
    }

    #[test]
    fn test_ambiguity_is_monotone() {
        let mut map = NeighborMap::default();
        map.insert(b"ACGT", 0);
        map.insert(b"ACGT", 0);
        assert_eq!(map.get(b"ACGT"), Some(Assignment::Sample(0)));
        map.insert(b"ACGT", 1);
        assert_eq!(map.get(b"ACGT"), Some(Assignment::Ambiguous));
        map.insert(b"ACGT", 0);
        map.insert(b"ACGT", 1);
        assert_eq!(map.get(b"ACGT"), Some(Assignment::Ambiguous));
    }

    #[test]
    fn test_unmatched_and_length_mismatch() {
        let resolver = BarcodeResolver::from_called(&called(&[&["AAAA"]]));
        assert_eq!(resolver.resolve(b"CCCC"), Resolution::Unmatched);
        assert_eq!(resolver.resolve(b"AAAAA"), Resolution::Unmatched);
        assert_eq!(resolver.resolve(b"AAA"), Resolution::Unmatched);
        assert_eq!(resolver.resolve(b"AANA"), Resolution::Unmatched);
    }

    #[test]
    fn test_barcode_called_in_two_samples_is_ambiguous() {
        let resolver = BarcodeResolver::from_called(&called(&[&["ACGT"], &["ACGT", "TTTT"]]));
        assert_eq!(resolver.num_conflicts(), 1);
        assert_eq!(resolver.resolve(b"ACGT"), Resolution::Ambiguous);
        assert_eq!(resolver.resolve(b"ACGA"), Resolution::Ambiguous);
        assert_eq!(resolver.resolve(b"TTTT"), Resolution::Exact(1));
        assert_eq!(resolver.num_exact(), 1);
    }

    #[test]
    fn test_resolution_sample() {
        assert_eq!(Resolution::Exact(2).sample(), Some(2));
        assert_eq!(Resolution::Corrected(1).sample(), Some(1));
        assert_eq!(Resolution::Ambiguous.sample(), None);
        assert_eq!(Resolution::Unmatched.sample(), None);
    }
}
