//! Error kinds raised while demultiplexing.

use std::path::PathBuf;

use thiserror::Error;

use crate::extract::Mate;

/// Result type alias for the typed demultiplexing errors.
pub type Result<T> = std::result::Result<T, DemuxError>;

/// Fatal errors. Unmatched or ambiguous barcodes are never errors, they are
/// counted and excluded from the output.
#[derive(Error, Debug)]
pub enum DemuxError {
    /// The run configuration is missing a section or has an invalid value.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// No expected cell count was supplied for a sample.
    #[error("Missing expected cell number for sample '{sample}' in library '{library}'")]
    MissingCellCount {
        /// Library the sample belongs to
        library: String,
        /// Sample without a cell count
        sample: String,
    },

    /// A FASTQ record is truncated or internally inconsistent.
    #[error("Malformed record #{record} in {}: {reason}", path.display())]
    MalformedRecord {
        /// File the record was read from
        path: PathBuf,
        /// 1-based ordinal of the offending record
        record: u64,
        /// What is wrong with it
        reason: String,
    },

    /// A position range ends past the end of the selected read.
    #[error("Position {end} of {field} exceeds {mate} read length {len} (read pair #{record})")]
    PositionOutOfRange {
        /// Field being extracted
        field: &'static str,
        /// Mate the field is taken from
        mate: Mate,
        /// Configured 1-based end position
        end: usize,
        /// Actual sequence length
        len: usize,
        /// 1-based ordinal of the read pair, 0 when unknown
        record: u64,
    },

    /// The two mate files do not contain the same number of records.
    #[error("{} and {} are not paired: {reason} (after {records} read pairs)", r1.display(), r2.display())]
    Pairing {
        /// Mate 1 file
        r1: PathBuf,
        /// Mate 2 file
        r2: PathBuf,
        /// Read pairs consumed before the mismatch was found
        records: u64,
        /// Which side ran out
        reason: String,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DemuxError {
    #[cold]
    pub fn configuration<M: Into<String>>(msg: M) -> Self {
        DemuxError::Configuration(msg.into())
    }

    #[cold]
    pub fn malformed<P: Into<PathBuf>, M: Into<String>>(path: P, record: u64, reason: M) -> Self {
        DemuxError::MalformedRecord { path: path.into(), record, reason: reason.into() }
    }

    /// Attach the read pair ordinal to a position error raised without one.
    pub fn at_record(self, ordinal: u64) -> Self {
        match self {
            DemuxError::PositionOutOfRange { field, mate, end, len, .. } => {
                DemuxError::PositionOutOfRange { field, mate, end, len, record: ordinal }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_record_message() {
        let err = DemuxError::malformed("reads_R1.fq", 7, "quality length 3 != sequence length 4");
        let msg = format!("{err}");
        assert!(msg.contains("#7"));
        assert!(msg.contains("reads_R1.fq"));
        assert!(msg.contains("quality length"));
    }

    #[test]
    fn test_at_record_sets_ordinal() {
        let err = DemuxError::PositionOutOfRange {
            field: "umi",
            mate: Mate::R1,
            end: 30,
            len: 28,
            record: 0,
        }
        .at_record(42);
        match err {
            DemuxError::PositionOutOfRange { record, .. } => assert_eq!(record, 42),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(format!("{}", DemuxError::configuration("x").at_record(3)).contains("x"));
    }
}
