//! UMI deduplication and rank-based cell calling.
//!
//! Reads already assigned to a sample are collapsed into distinct UMIs per
//! `(sample, cell_barcode)`. Barcodes are then ranked per sample by their
//! distinct UMI count and the top `expected_cell_number` are called as cells.

use std::cmp::Reverse;
use std::collections::HashMap;

use log::info;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::categorize::{Categorized, HtoTable, SampleId};
use crate::error::{DemuxError, Result};
use crate::extract::FieldTable;

/// Distinct UMIs seen for each barcode of one sample, in first-seen order.
#[derive(Debug, Default)]
struct SampleUmis {
    order: Vec<Vec<u8>>,
    umis: FxHashMap<Vec<u8>, FxHashSet<Vec<u8>>>,
}

impl SampleUmis {
    fn insert(&mut self, barcode: &[u8], umi: &[u8]) {
        match self.umis.get_mut(barcode) {
            Some(set) => {
                set.insert(umi.to_vec());
            }
            None => {
                self.order.push(barcode.to_vec());
                let mut set = FxHashSet::default();
                set.insert(umi.to_vec());
                self.umis.insert(barcode.to_vec(), set);
            }
        }
    }
}

/// `(sample, cell_barcode) -> {umi}` for one HTO library.
#[derive(Debug, Default)]
pub struct DedupTable {
    samples: Vec<SampleUmis>,
}

impl DedupTable {
    /// Collapse the categorized rows of `fields`. Each sample is built
    /// independently.
    pub fn from_categorized(fields: &FieldTable, categorized: &Categorized) -> Self {
        let samples = categorized
            .rows
            .par_iter()
            .map(|rows| {
                let mut sample = SampleUmis::default();
                for &row in rows {
                    sample.insert(fields.cell_barcode(row), fields.umi(row));
                }
                sample
            })
            .collect();
        Self { samples }
    }

    /// Add one read by hand.
    pub fn insert(&mut self, sample: SampleId, barcode: &[u8], umi: &[u8]) {
        if self.samples.len() <= sample {
            self.samples.resize_with(sample + 1, SampleUmis::default);
        }
        self.samples[sample].insert(barcode, umi);
    }

    /// Distinct UMIs recorded for `barcode` in `sample`.
    pub fn umi_count(&self, sample: SampleId, barcode: &[u8]) -> usize {
        self.samples
            .get(sample)
            .and_then(|s| s.umis.get(barcode))
            .map_or(0, FxHashSet::len)
    }

    /// Sum of distinct UMIs over every barcode, optionally for one sample only.
    pub fn total_umis(&self, sample: Option<SampleId>) -> usize {
        self.samples
            .iter()
            .enumerate()
            .filter(|(id, _)| sample.map_or(true, |s| s == *id))
            .flat_map(|(_, s)| s.umis.values())
            .map(FxHashSet::len)
            .sum()
    }

    /// Barcodes ranked per sample by descending distinct UMI count. Samples
    /// follow [`SampleId`] order; ties keep first-seen order.
    pub fn rank(&self) -> Vec<RankedBarcode> {
        let mut ranked = Vec::new();
        for (sample, umis) in self.samples.iter().enumerate() {
            let mut rows: Vec<RankedBarcode> = umis
                .order
                .iter()
                .map(|bc| RankedBarcode { sample, cell_barcode: bc.clone(), umi_count: self.umi_count(sample, bc) })
                .collect();
            rows.sort_by_key(|r| Reverse(r.umi_count));
            ranked.extend(rows);
        }
        ranked
    }
}

/// One row of the ranked barcode table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedBarcode {
    pub sample: SampleId,
    pub cell_barcode: Vec<u8>,
    pub umi_count: usize,
}

/// Drop barcodes with fewer than `min_umi` distinct UMIs.
pub fn filter_min_umi(ranked: &mut Vec<RankedBarcode>, min_umi: usize) {
    let before = ranked.len();
    ranked.retain(|r| r.umi_count >= min_umi);
    info!("Kept {} of {} cell barcodes with at least {} UMIs", ranked.len(), before, min_umi);
}

/// The barcodes called as cells, per sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalledBarcodes {
    per_sample: Vec<Vec<Vec<u8>>>,
}

impl CalledBarcodes {
    pub fn from_samples(per_sample: Vec<Vec<Vec<u8>>>) -> Self {
        Self { per_sample }
    }

    pub fn sample(&self, id: SampleId) -> &[Vec<u8>] {
        &self.per_sample[id]
    }

    /// Total number of called barcodes.
    pub fn len(&self) -> usize {
        self.per_sample.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (SampleId, &[u8])> {
        self.per_sample
            .iter()
            .enumerate()
            .flat_map(|(id, bcs)| bcs.iter().map(move |bc| (id, bc.as_slice())))
    }
}

/// Keep the first `expected[sample]` rows of each sample in `ranked`, which
/// must already be ordered as [`DedupTable::rank`] returns them.
pub fn call_cells(
    library: &str,
    ranked: &[RankedBarcode],
    table: &HtoTable,
    expected: &HashMap<String, usize>,
) -> Result<CalledBarcodes> {
    let mut per_sample = Vec::with_capacity(table.len());
    for (id, name) in table.samples().iter().enumerate() {
        let &wanted = expected.get(name).ok_or_else(|| DemuxError::MissingCellCount {
            library: library.to_string(),
            sample: name.clone(),
        })?;
        let called: Vec<Vec<u8>> = ranked
            .iter()
            .filter(|r| r.sample == id)
            .take(wanted)
            .map(|r| r.cell_barcode.clone())
            .collect();
        if called.len() < wanted {
            info!("Sample {name}: only {} barcodes available, {wanted} expected", called.len());
        }
        per_sample.push(called);
    }
    Ok(CalledBarcodes { per_sample })
}
