use log::{debug, info, warn};
use rayon::prelude::*;

use crate::error::{DemuxError, Result};
use crate::extract::FieldTable;

/// Index of a sample within its library's [`HtoTable`].
pub type SampleId = usize;

/// Sample names and their HTO sequences for one library, in configuration
/// order.
#[derive(Debug, Clone, Default)]
pub struct HtoTable {
    samples: Vec<String>,
    htos: Vec<Vec<u8>>,
}

impl HtoTable {
    /// Build a table, rejecting repeated sample names. Samples may share an
    /// HTO sequence; reads carrying it go to the first of them.
    pub fn new<S, H, I>(entries: I) -> Result<Self>
    where
        S: Into<String>,
        H: Into<Vec<u8>>,
        I: IntoIterator<Item = (S, H)>,
    {
        let mut table = HtoTable::default();
        for (sample, hto) in entries {
            let sample = sample.into();
            let hto = hto.into();
            if table.samples.contains(&sample) {
                return Err(DemuxError::configuration(format!("sample '{sample}' is listed twice")));
            }
            if let Some(other) = table.htos.iter().position(|h| *h == hto) {
                warn!(
                    "Samples '{}' and '{}' share HTO sequence {}; its reads go to '{}'",
                    table.samples[other],
                    sample,
                    String::from_utf8_lossy(&hto),
                    table.samples[other]
                );
            }
            table.samples.push(sample);
            table.htos.push(hto);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample(&self, id: SampleId) -> &str {
        &self.samples[id]
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn hto(&self, id: SampleId) -> &[u8] {
        &self.htos[id]
    }

    pub fn sample_id(&self, name: &str) -> Option<SampleId> {
        self.samples.iter().position(|s| s == name)
    }
}

/// Assign one HTO sequence to a sample by exact equality. The first sample
/// in configuration order wins.
pub fn categorize(hto: &[u8], table: &HtoTable) -> Option<SampleId> {
    table.htos.iter().position(|h| h.as_slice() == hto)
}

/// Rows of a [`FieldTable`] grouped by sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Categorized {
    /// Row ordinals per sample, ascending, indexed by [`SampleId`].
    pub rows: Vec<Vec<usize>>,
    /// Rows whose HTO matched no sample.
    pub unassigned: usize,
}

impl Categorized {
    pub fn assigned(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }
}

/// Categorize every row of `fields`. Samples are scanned in parallel, each
/// into its own row list; the lists are only combined once all scans finish.
/// A sample whose HTO is owned by an earlier sample gets no rows.
pub fn categorize_table(fields: &FieldTable, table: &HtoTable) -> Categorized {
    let column = fields.hto_column();
    let rows: Vec<Vec<usize>> = (0..table.len())
        .into_par_iter()
        .map(|id| {
            let hto = table.hto(id);
            if categorize(hto, table) != Some(id) {
                return Vec::new();
            }
            column
                .iter()
                .enumerate()
                .filter(|(_, h)| h.as_slice() == hto)
                .map(|(row, _)| row)
                .collect()
        })
        .collect();

    let assigned: usize = rows.iter().map(Vec::len).sum();
    let unassigned = fields.len() - assigned;
    for (id, sample_rows) in rows.iter().enumerate() {
        info!("Sample {}: {} reads categorized", table.sample(id), sample_rows.len());
    }
    debug!("{unassigned} reads not assigned to any sample");

    Categorized { rows, unassigned }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractedFields;

    fn fields(htos: &[&[u8]]) -> FieldTable {
        htos.iter()
            .map(|h| ExtractedFields { cell_barcode: b"AAAA".to_vec(), umi: b"UUUU".to_vec(), hto: h.to_vec() })
            .collect()
    }

    #[test]
    fn test_categorize_reads_by_hto() {
        let table = HtoTable::new([("sample1", "AAA"), ("sample2", "CCC")]).unwrap();
        let reads = fields(&[b"AAA", b"CCC", b"AAA"]);
        let cat = categorize_table(&reads, &table);
        assert_eq!(cat.rows[0], vec![0, 2]);
        assert_eq!(cat.rows[1], vec![1]);
        assert_eq!(cat.unassigned, 0);
        assert_eq!(cat.assigned(), 3);
    }

    #[test]
    fn test_unmatched_reads_are_counted() {
        let table = HtoTable::new([("sample1", "AAA"), ("sample2", "CCC")]).unwrap();
        let reads = fields(&[b"AAA", b"GGG", b"AAT", b"CCC"]);
        let cat = categorize_table(&reads, &table);
        assert_eq!(cat.assigned(), 2);
        assert_eq!(cat.unassigned, 2);
    }

    #[test]
    fn test_single_lookup_is_exact() {
        let table = HtoTable::new([("s1", "ACGT")]).unwrap();
        assert_eq!(categorize(b"ACGT", &table), Some(0));
        assert_eq!(categorize(b"ACGA", &table), None);
        assert_eq!(categorize(b"ACG", &table), None);
    }

    #[test]
    fn test_shared_hto_goes_to_first_sample() {
        let table = HtoTable::new([("s1", "AAA"), ("s2", "CCC"), ("s3", "AAA")]).unwrap();
        assert_eq!(categorize(b"AAA", &table), Some(0));
        let reads = fields(&[b"AAA", b"CCC", b"AAA", b"GGG"]);
        let cat = categorize_table(&reads, &table);
        assert_eq!(cat.rows[0], vec![0, 2]);
        assert_eq!(cat.rows[1], vec![1]);
        assert!(cat.rows[2].is_empty());
        assert_eq!(cat.assigned(), 3);
        assert_eq!(cat.unassigned, 1);
    }

    #[test]
    fn test_duplicate_sample_rejected() {
        assert!(HtoTable::new([("s1", "AAA"), ("s1", "CCC")]).is_err());
        let table = HtoTable::new([("s1", "AAA"), ("s2", "CCC")]).unwrap();
        assert_eq!(table.sample_id("s2"), Some(1));
        assert_eq!(table.sample(0), "s1");
    }
}
