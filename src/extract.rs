use std::fmt;

use serde::Deserialize;

use crate::error::{DemuxError, Result};

/// Which read of a pair a field is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Mate {
    R1,
    R2,
}

impl fmt::Display for Mate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mate::R1 => f.write_str("R1"),
            Mate::R2 => f.write_str("R2"),
        }
    }
}

/// A 1-based inclusive `[start, end]` range on one mate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPosition {
    mate: Mate,
    start: usize,
    end: usize,
}

impl FieldPosition {
    /// Create a position, requiring `end >= start >= 1`.
    pub fn new(mate: Mate, start: usize, end: usize) -> Result<Self> {
        if start == 0 || end < start {
            return Err(DemuxError::configuration(format!(
                "invalid {mate} range [{start}, {end}]: expected end >= start >= 1"
            )));
        }
        Ok(Self { mate, start, end })
    }

    /// Pick the configured mate out of a pair of sequences.
    #[inline]
    pub fn select<'a>(&self, r1: &'a [u8], r2: &'a [u8]) -> &'a [u8] {
        match self.mate {
            Mate::R1 => r1,
            Mate::R2 => r2,
        }
    }

    /// Slice `seq[start - 1 .. end]`. The read is never truncated to fit.
    #[inline]
    pub fn slice<'a>(&self, field: &'static str, seq: &'a [u8]) -> Result<&'a [u8]> {
        if self.end > seq.len() {
            return Err(DemuxError::PositionOutOfRange {
                field,
                mate: self.mate,
                end: self.end,
                len: seq.len(),
                record: 0,
            });
        }
        Ok(&seq[self.start - 1..self.end])
    }
}

/// Where the cell barcode, UMI and HTO live within a read pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionSpec {
    pub cell_barcode: FieldPosition,
    pub umi: FieldPosition,
    pub hto: FieldPosition,
}

/// The fields sliced out of one read pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFields {
    pub cell_barcode: Vec<u8>,
    pub umi: Vec<u8>,
    pub hto: Vec<u8>,
}

/// Extract the cell barcode, UMI and HTO from the two mate sequences.
pub fn extract(r1: &[u8], r2: &[u8], spec: &PositionSpec) -> Result<ExtractedFields> {
    let take = |field: &'static str, pos: &FieldPosition| -> Result<Vec<u8>> {
        pos.slice(field, pos.select(r1, r2)).map(<[u8]>::to_vec)
    };
    Ok(ExtractedFields {
        cell_barcode: take("cell_barcode", &spec.cell_barcode)?,
        umi: take("umi", &spec.umi)?,
        hto: take("hto", &spec.hto)?,
    })
}

/// Column-wise store of extracted fields for one library, indexed by row
/// ordinal (the read pair's position in the input).
#[derive(Debug, Default)]
pub struct FieldTable {
    cell_barcode: Vec<Vec<u8>>,
    umi: Vec<Vec<u8>>,
    hto: Vec<Vec<u8>>,
}

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fields: ExtractedFields) {
        self.cell_barcode.push(fields.cell_barcode);
        self.umi.push(fields.umi);
        self.hto.push(fields.hto);
    }

    pub fn len(&self) -> usize {
        self.hto.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hto.is_empty()
    }

    pub fn cell_barcode(&self, row: usize) -> &[u8] {
        &self.cell_barcode[row]
    }

    pub fn umi(&self, row: usize) -> &[u8] {
        &self.umi[row]
    }

    pub fn hto(&self, row: usize) -> &[u8] {
        &self.hto[row]
    }

    /// The whole HTO column.
    pub fn hto_column(&self) -> &[Vec<u8>] {
        &self.hto
    }
}

impl FromIterator<ExtractedFields> for FieldTable {
    fn from_iter<I: IntoIterator<Item = ExtractedFields>>(iter: I) -> Self {
        let mut table = FieldTable::new();
        iter.into_iter().for_each(|f| table.push(f));
        table
    }
}
