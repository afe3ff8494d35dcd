use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use needletail::errors::ParseErrorKind;
use needletail::{parse_fastx_file, FastxReader};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::categorize::HtoTable;
use crate::cells::RankedBarcode;
use crate::error::DemuxError;

/// An owned FASTQ record. Sequence and quality always have the same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    /// The header line without the leading `@`
    pub head: Vec<u8>,
    pub seq: Vec<u8>,
    /// Whatever followed `+` on the separator line, usually nothing
    pub sep: Vec<u8>,
    pub qual: Vec<u8>,
}

impl ReadRecord {
    pub fn new(head: &[u8], seq: &[u8], qual: &[u8]) -> Self {
        Self { head: head.to_vec(), seq: seq.to_vec(), sep: Vec::new(), qual: qual.to_vec() }
    }

    pub fn with_separator(mut self, sep: &[u8]) -> Self {
        self.sep = sep.to_vec();
        self
    }
}

/// The text after `+` on the third line of a raw FASTQ record.
fn separator_comment(raw: &[u8]) -> &[u8] {
    raw.split(|&b| b == b'\n')
        .nth(2)
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .and_then(|line| line.strip_prefix(b"+"))
        .unwrap_or_default()
}

/// Compression of a FASTQ file, from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Fastq,
    FastqGz,
}

impl FileType {
    /// Supports `.fq`, `.fastq`, `.fq.gz` and `.fastq.gz`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let fname = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid file name {}", path.display()))?
            .to_lowercase();

        if fname.ends_with(".fq.gz") || fname.ends_with(".fastq.gz") {
            return Ok(FileType::FastqGz);
        }
        if fname.ends_with(".fq") || fname.ends_with(".fastq") {
            return Ok(FileType::Fastq);
        }
        anyhow::bail!("Unsupported file type: {}", fname)
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            FileType::Fastq => "fastq",
            FileType::FastqGz => "fastq.gz",
        }
    }

    /// `(R1, R2)` output paths for `sample` inside `dir`.
    pub fn sample_paths(&self, dir: &Path, sample: &str) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("{}_R1.{}", sample, self.suffix())),
            dir.join(format!("{}_R2.{}", sample, self.suffix())),
        )
    }
}

/// Lazily decodes a FASTQ file (plain or gzip) into batches of records.
///
/// `next_batch` returns `Ok(None)` once the file is exhausted and keeps
/// doing so; the stream cannot be restarted.
pub struct RecordBatches {
    path: PathBuf,
    reader: Option<Box<dyn FastxReader>>,
    batch_size: usize,
    records: u64,
}

impl RecordBatches {
    pub fn open(path: &Path, batch_size: usize) -> crate::error::Result<Self> {
        let batch_size = batch_size.max(1);
        // 0-byte files make the parser bail, treat them as empty streams
        let metadata = fs::metadata(path)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))?;
        if metadata.len() == 0 {
            return Ok(Self { path: path.to_path_buf(), reader: None, batch_size, records: 0 });
        }
        let reader = match parse_fastx_file(path) {
            Ok(r) => Some(r),
            Err(e) if e.kind == ParseErrorKind::EmptyFile => None,
            Err(e) if e.kind == ParseErrorKind::Io => {
                return Err(io::Error::new(io::ErrorKind::Other, format!("{}: {}", path.display(), e)).into());
            }
            Err(e) => return Err(DemuxError::malformed(path, 1, e.to_string())),
        };
        Ok(Self { path: path.to_path_buf(), reader, batch_size, records: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_batch(&mut self) -> crate::error::Result<Option<Vec<ReadRecord>>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        match fill_batch(&mut **reader, &self.path, &mut self.records, self.batch_size) {
            Ok((batch, exhausted)) => {
                if exhausted {
                    self.reader = None;
                }
                Ok(if batch.is_empty() { None } else { Some(batch) })
            }
            Err(e) => {
                self.reader = None;
                Err(e)
            }
        }
    }
}

/// Decode up to `batch_size` records. The flag is set once the reader has no
/// records left.
fn fill_batch(
    reader: &mut dyn FastxReader,
    path: &Path,
    records: &mut u64,
    batch_size: usize,
) -> crate::error::Result<(Vec<ReadRecord>, bool)> {
    let mut batch = Vec::with_capacity(batch_size);
    while batch.len() < batch_size {
        let Some(record) = reader.next() else {
            return Ok((batch, true));
        };
        let ordinal = *records + 1;
        let r = record.map_err(|e| DemuxError::malformed(path, ordinal, e.to_string()))?;
        let qual = r
            .qual()
            .ok_or_else(|| DemuxError::malformed(path, ordinal, "record has no quality line"))?;
        let seq = r.seq();
        if seq.len() != qual.len() {
            let reason = format!("sequence length {} != quality length {}", seq.len(), qual.len());
            return Err(DemuxError::malformed(path, ordinal, reason));
        }
        batch.push(ReadRecord::new(r.id(), &seq, qual).with_separator(separator_comment(r.all())));
        *records = ordinal;
    }
    Ok((batch, false))
}

impl Iterator for RecordBatches {
    type Item = crate::error::Result<Vec<ReadRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

/// Matching batches from the two mate files. `r1[i]` and `r2[i]` form the
/// read pair with ordinal `first + i`.
#[derive(Debug)]
pub struct PairBatch {
    pub first: u64,
    pub r1: Vec<ReadRecord>,
    pub r2: Vec<ReadRecord>,
}

impl PairBatch {
    pub fn len(&self) -> usize {
        self.r1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r1.is_empty()
    }
}

/// Two [`RecordBatches`] advanced in lockstep. Fails as soon as one mate
/// runs out before the other.
pub struct PairedBatches {
    r1: RecordBatches,
    r2: RecordBatches,
    pairs: u64,
    failed: bool,
}

impl PairedBatches {
    pub fn open(r1: &Path, r2: &Path, batch_size: usize) -> crate::error::Result<Self> {
        Ok(Self::new(RecordBatches::open(r1, batch_size)?, RecordBatches::open(r2, batch_size)?))
    }

    pub fn new(r1: RecordBatches, r2: RecordBatches) -> Self {
        Self { r1, r2, pairs: 0, failed: false }
    }

    /// Read pairs handed out so far.
    pub fn pairs_read(&self) -> u64 {
        self.pairs
    }

    pub fn next_batch(&mut self) -> crate::error::Result<Option<PairBatch>> {
        if self.failed {
            return Ok(None);
        }
        let (r1, r2) = rayon::join(|| self.r1.next_batch(), || self.r2.next_batch());
        let batch = match (r1, r2) {
            (Err(e), _) | (_, Err(e)) => {
                self.failed = true;
                return Err(e);
            }
            (Ok(None), Ok(None)) => return Ok(None),
            (Ok(Some(r1)), Ok(Some(r2))) if r1.len() == r2.len() => {
                PairBatch { first: self.pairs + 1, r1, r2 }
            }
            (Ok(r1), Ok(r2)) => {
                let (n1, n2) = (r1.map_or(0, |b| b.len()), r2.map_or(0, |b| b.len()));
                let short = if n1 < n2 { self.r1.path() } else { self.r2.path() };
                self.failed = true;
                return Err(DemuxError::Pairing {
                    r1: self.r1.path().to_path_buf(),
                    r2: self.r2.path().to_path_buf(),
                    records: self.pairs + n1.min(n2) as u64,
                    reason: format!("{} has fewer records", short.display()),
                });
            }
        };
        self.pairs += batch.len() as u64;
        Ok(Some(batch))
    }
}

impl Iterator for PairedBatches {
    type Item = crate::error::Result<PairBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

/// A FASTQ output, plain or gzip compressed.
pub enum FastqWriter {
    Plain(Box<dyn Write>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl FastqWriter {
    /// Create a writer for `path`; gzip if it ends with `.gz`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let writer = BufWriter::new(file);
        if path.extension().map_or(false, |e| e == "gz") {
            Ok(Self::Gzip(GzEncoder::new(writer, Compression::default())))
        } else {
            Ok(Self::Plain(Box::new(writer)))
        }
    }

    fn inner(&mut self) -> &mut dyn Write {
        match self {
            Self::Plain(w) => w,
            Self::Gzip(w) => w,
        }
    }

    /// Write a single `@<head>\n<seq>\n+<sep>\n<qual>\n` entry.
    pub fn write_record(&mut self, rec: &ReadRecord) -> io::Result<()> {
        let w = self.inner();
        w.write_all(b"@")?;
        w.write_all(&rec.head)?;
        w.write_all(b"\n")?;
        w.write_all(&rec.seq)?;
        w.write_all(b"\n+")?;
        w.write_all(&rec.sep)?;
        w.write_all(b"\n")?;
        w.write_all(&rec.qual)?;
        w.write_all(b"\n")
    }

    /// Flush everything, writing the gzip trailer if any.
    pub fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(mut w) => w.flush(),
            Self::Gzip(w) => w.finish()?.flush(),
        }
    }
}

/// The R1 and R2 outputs of one sample.
pub struct MatePairWriter {
    r1: FastqWriter,
    r2: FastqWriter,
    paths: Vec<PathBuf>,
}

impl MatePairWriter {
    pub fn create(r1: &Path, r2: &Path) -> Result<Self> {
        let w1 = FastqWriter::create(r1)?;
        let w2 = match FastqWriter::create(r2) {
            Ok(w) => w,
            Err(e) => {
                drop(w1);
                let _ = fs::remove_file(r1);
                return Err(e);
            }
        };
        Ok(Self { r1: w1, r2: w2, paths: vec![r1.to_path_buf(), r2.to_path_buf()] })
    }

    /// Wrap existing writers; nothing is removed by [`MatePairWriter::discard`].
    pub fn from_writers(r1: FastqWriter, r2: FastqWriter) -> Self {
        Self { r1, r2, paths: Vec::new() }
    }

    #[inline]
    pub fn write_pair(&mut self, r1: &ReadRecord, r2: &ReadRecord) -> io::Result<()> {
        self.r1.write_record(r1)?;
        self.r2.write_record(r2)
    }

    pub fn finish(self) -> io::Result<()> {
        let r1 = self.r1.finish();
        let r2 = self.r2.finish();
        r1.and(r2)
    }

    /// Close without finishing and delete the files.
    pub fn discard(self) {
        let Self { r1, r2, paths } = self;
        drop(r1);
        drop(r2);
        for path in paths {
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("Could not remove partial output {}: {}", path.display(), e);
            }
        }
    }
}

/// Write one barcode per line.
pub fn write_barcode_list(path: &Path, barcodes: &[Vec<u8>]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for bc in barcodes {
        w.write_all(bc)?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct RankedRow<'a> {
    sample: &'a str,
    cell_barcode: &'a str,
    umi_count: usize,
}

/// Write the ranked barcode table as CSV with a
/// `sample,cell_barcode,umi_count` header.
pub fn write_ranked_table(path: &Path, ranked: &[RankedBarcode], table: &HtoTable) -> Result<()> {
    let mut w = csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    for r in ranked {
        let cell_barcode = String::from_utf8_lossy(&r.cell_barcode);
        w.serialize(RankedRow { sample: table.sample(r.sample), cell_barcode: &cell_barcode, umi_count: r.umi_count })?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    fn fastq(records: &[(&str, &str)]) -> String {
        records
            .iter()
            .map(|(id, seq)| format!("@{}\n{}\n+\n{}\n", id, seq, "F".repeat(seq.len())))
            .collect()
    }

    #[test]
    fn test_batches_preserve_order_and_short_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reads.fastq");
        fs::write(&path, fastq(&[("r1", "ACGT"), ("r2", "TTTT"), ("r3", "GGGG")])).unwrap();

        let batches: Vec<Vec<ReadRecord>> =
            RecordBatches::open(&path, 2).unwrap().collect::<crate::error::Result<_>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[0][1].head, b"r2");
        assert_eq!(batches[1][0].seq, b"GGGG");
    }

    #[test]
    fn test_batch_size_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reads.fq");
        fs::write(&path, fastq(&[("read1", "ACGTACGTACGT"), ("read2", "TGCACTGCACTG")])).unwrap();
        let mut stream = RecordBatches::open(&path, 1).unwrap();
        assert_eq!(stream.next_batch().unwrap().unwrap().len(), 1);
        assert_eq!(stream.next_batch().unwrap().unwrap().len(), 1);
        assert!(stream.next_batch().unwrap().is_none());
        assert!(stream.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_gzip_input() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reads.fastq.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(fastq(&[("r1", "ACGT"), ("r2", "CCCC")]).as_bytes()).unwrap();
        enc.finish().unwrap();

        let mut stream = RecordBatches::open(&path, 10).unwrap();
        let batch = stream.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].seq, b"CCCC");
    }

    #[test]
    fn test_empty_file_is_empty_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.fastq");
        File::create(&path).unwrap();
        let mut stream = RecordBatches::open(&path, 10).unwrap();
        assert!(stream.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_quality_length_mismatch_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.fastq");
        fs::write(&path, "@r1\nACGT\n+\nFFFF\n@r2\nACGT\n+\nFF\n").unwrap();
        let err = RecordBatches::open(&path, 10).unwrap().next_batch().unwrap_err();
        assert!(matches!(err, DemuxError::MalformedRecord { .. }), "{err:?}");
    }

    #[test]
    fn test_truncated_record_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.fastq");
        fs::write(&path, "@r1\nACGT\n+\nFFFF\n@r2\nACGT\n").unwrap();
        let mut stream = RecordBatches::open(&path, 10).unwrap();
        let err = stream.next_batch().unwrap_err();
        match err {
            DemuxError::MalformedRecord { record, .. } => assert_eq!(record, 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(stream.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_paired_batches_lockstep() {
        let dir = tempdir().unwrap();
        let p1 = dir.path().join("r1.fastq");
        let p2 = dir.path().join("r2.fastq");
        fs::write(&p1, fastq(&[("a", "AAAA"), ("b", "CCCC"), ("c", "GGGG")])).unwrap();
        fs::write(&p2, fastq(&[("a", "TTTT"), ("b", "TTTT"), ("c", "TTTT")])).unwrap();

        let mut pairs = PairedBatches::open(&p1, &p2, 2).unwrap();
        let first = pairs.next_batch().unwrap().unwrap();
        assert_eq!(first.first, 1);
        assert_eq!(first.len(), 2);
        let second = pairs.next_batch().unwrap().unwrap();
        assert_eq!(second.first, 3);
        assert_eq!(second.r1[0].head, b"c");
        assert!(pairs.next_batch().unwrap().is_none());
        assert_eq!(pairs.pairs_read(), 3);
    }

    #[test]
    fn test_paired_batches_fail_on_uneven_mates() {
        let dir = tempdir().unwrap();
        let p1 = dir.path().join("r1.fastq");
        let p2 = dir.path().join("r2.fastq");
        fs::write(&p1, fastq(&[("a", "AAAA"), ("b", "CCCC")])).unwrap();
        fs::write(&p2, fastq(&[("a", "TTTT"), ("b", "TTTT"), ("c", "TTTT")])).unwrap();

        // batch boundary falls exactly where R1 ends
        let mut pairs = PairedBatches::open(&p1, &p2, 2).unwrap();
        assert_eq!(pairs.next_batch().unwrap().unwrap().len(), 2);
        let err = pairs.next_batch().unwrap_err();
        match err {
            DemuxError::Pairing { records, .. } => assert_eq!(records, 2),
            other => panic!("unexpected error {other:?}"),
        }

        // and inside a batch
        let mut pairs = PairedBatches::open(&p1, &p2, 10).unwrap();
        assert!(matches!(pairs.next_batch(), Err(DemuxError::Pairing { .. })));
        assert!(pairs.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_gzip_writer_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out_R1.fastq.gz");
        let mut w = FastqWriter::create(&path).unwrap();
        assert!(matches!(w, FastqWriter::Gzip(_)));
        w.write_record(&ReadRecord::new(b"r1 1:N:0", b"ACGT", b"IIII")).unwrap();
        w.finish().unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&path).unwrap()).read_to_string(&mut text).unwrap();
        assert_eq!(text, "@r1 1:N:0\nACGT\n+\nIIII\n");
    }

    #[test]
    fn test_records_written_verbatim() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.fastq");
        let text = "@g1 1:N:0\nACGTACGT\n+g1 1:N:0\nIIIIIIII\n@g2 1:N:0\nTTTT\n+\nFFFF\n";
        fs::write(&input, text).unwrap();

        let batch = RecordBatches::open(&input, 10).unwrap().next_batch().unwrap().unwrap();
        assert_eq!(batch[0].sep, b"g1 1:N:0");
        assert!(batch[1].sep.is_empty());

        let output = dir.path().join("out.fastq");
        let mut w = FastqWriter::create(&output).unwrap();
        for rec in &batch {
            w.write_record(rec).unwrap();
        }
        w.finish().unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), text);
    }

    #[test]
    fn test_missing_input_names_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent_R1.fastq");
        let err = RecordBatches::open(&path, 10).err().unwrap();
        assert!(matches!(err, DemuxError::Io(_)));
        assert!(err.to_string().contains("absent_R1.fastq"), "{err}");
    }

    #[test]
    fn test_discard_removes_partial_files() {
        let dir = tempdir().unwrap();
        let (p1, p2) = FileType::Fastq.sample_paths(dir.path(), "s1");
        let mut w = MatePairWriter::create(&p1, &p2).unwrap();
        let rec = ReadRecord::new(b"r", b"A", b"F");
        w.write_pair(&rec, &rec).unwrap();
        assert!(p1.exists() && p2.exists());
        w.discard();
        assert!(!p1.exists());
        assert!(!p2.exists());
    }

    #[test]
    fn test_filetype_and_sample_paths() {
        assert_eq!(FileType::from_path(Path::new("gex_R1.fastq.gz")).unwrap(), FileType::FastqGz);
        assert_eq!(FileType::from_path(Path::new("gex_R1.FQ")).unwrap(), FileType::Fastq);
        assert!(FileType::from_path(Path::new("gex.bam")).is_err());
        let (r1, r2) = FileType::FastqGz.sample_paths(Path::new("out"), "s1");
        assert_eq!(r1, Path::new("out/s1_R1.fastq.gz"));
        assert_eq!(r2, Path::new("out/s1_R2.fastq.gz"));
    }

    #[test]
    fn test_ranked_table_and_barcode_list() {
        let dir = tempdir().unwrap();
        let table = HtoTable::new([("s1", "AAA"), ("s2", "CCC")]).unwrap();
        let ranked = vec![
            RankedBarcode { sample: 0, cell_barcode: b"ACGT".to_vec(), umi_count: 3 },
            RankedBarcode { sample: 1, cell_barcode: b"TTTT".to_vec(), umi_count: 1 },
        ];
        let csv_path = dir.path().join("ranked.csv");
        write_ranked_table(&csv_path, &ranked, &table).unwrap();
        assert_eq!(
            fs::read_to_string(&csv_path).unwrap(),
            "sample,cell_barcode,umi_count\ns1,ACGT,3\ns2,TTTT,1\n"
        );

        let list = dir.path().join("s1_cell_barcodes.txt");
        write_barcode_list(&list, &[b"ACGT".to_vec(), b"GGGG".to_vec()]).unwrap();
        assert_eq!(fs::read_to_string(&list).unwrap(), "ACGT\nGGGG\n");
    }
}
