use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::categorize::{categorize_table, Categorized};
use crate::cells::{call_cells, filter_min_umi, CalledBarcodes, DedupTable, RankedBarcode};
use crate::config::{LibraryPlan, RunPlan};
use crate::error::DemuxError;
use crate::extract::{extract, ExtractedFields, FieldPosition, FieldTable, PositionSpec};
use crate::io::{write_barcode_list, write_ranked_table, MatePairWriter, PairBatch, PairedBatches};
use crate::matcher::{BarcodeResolver, Resolution};
use crate::stats::Statistics;

/// Read pairs decoded per chunk unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

pub(crate) fn make_progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(1));
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}: {human_pos} read pairs ({per_sec})")
    {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(1_000));
    pb
}

/// Extract the fields of every read pair, a chunk at a time. Extraction runs
/// in parallel; rows keep input order.
pub fn extract_pairs<I>(batches: I, spec: &PositionSpec, progress: &ProgressBar) -> Result<FieldTable>
where
    I: Iterator<Item = crate::error::Result<PairBatch>>,
{
    let mut table = FieldTable::new();
    for batch in batches {
        let batch = batch?;
        let fields: Vec<ExtractedFields> = batch
            .r1
            .par_iter()
            .zip(batch.r2.par_iter())
            .enumerate()
            .map(|(i, (r1, r2))| extract(&r1.seq, &r2.seq, spec).map_err(|e| e.at_record(batch.first + i as u64)))
            .collect::<crate::error::Result<_>>()?;
        progress.inc(fields.len() as u64);
        fields.into_iter().for_each(|f| table.push(f));
    }
    Ok(table)
}

/// Outcome of the HTO library pass.
#[derive(Debug)]
pub struct HtoLibraryResult {
    pub categorized: Categorized,
    pub dedup: DedupTable,
    pub ranked: Vec<RankedBarcode>,
    pub called: CalledBarcodes,
}

/// Categorize, deduplicate and call cells on an extracted HTO library.
pub fn call_hto_library(plan: &LibraryPlan, fields: &FieldTable, stats: &mut Statistics) -> Result<HtoLibraryResult> {
    let samples = plan.htos.samples();

    let categorized = categorize_table(fields, &plan.htos);
    stats.set("Valid HTOs", categorized.assigned());
    for (id, sample) in samples.iter().enumerate() {
        stats.set(format!("{sample} HTOs"), categorized.rows[id].len());
    }
    stats.set("Unassigned HTOs", categorized.unassigned);

    let dedup = DedupTable::from_categorized(fields, &categorized);
    stats.set("Unique barcodes and UMIs", dedup.total_umis(None));
    for (id, sample) in samples.iter().enumerate() {
        stats.set(format!("Unique barcodes and UMIs of {sample}"), dedup.total_umis(Some(id)));
    }

    let mut ranked = dedup.rank();
    if let Some(min_umi) = plan.min_umi {
        filter_min_umi(&mut ranked, min_umi);
        stats.set("Barcodes with at least min_umi UMIs", ranked.len());
    }

    let called = call_cells(&plan.name, &ranked, &plan.htos, &plan.expected_cells)?;
    stats.set("Filtered barcodes", called.len());
    for (id, sample) in samples.iter().enumerate() {
        stats.set(format!("Filtered barcodes of {sample}"), called.sample(id).len());
    }

    Ok(HtoLibraryResult { categorized, dedup, ranked, called })
}

/// Stream the HTO library of `plan` and call its cells.
pub fn process_hto_library(
    plan: &LibraryPlan,
    batch_size: usize,
    stats: &mut Statistics,
    progress: &ProgressBar,
) -> Result<HtoLibraryResult> {
    info!("Processing HTO library for {}: R1={}, R2={}", plan.name, plan.hto_r1.display(), plan.hto_r2.display());
    stats.set("HTO R1 FASTQ", plan.hto_r1.display());
    stats.set("HTO R2 FASTQ", plan.hto_r2.display());

    progress.set_message(format!("{} HTO", plan.name));
    progress.set_position(0);
    let mut batches = PairedBatches::open(&plan.hto_r1, &plan.hto_r2, batch_size)?;
    let fields = extract_pairs(&mut batches, &plan.positions, progress)?;
    info!("Loaded {} HTO read pairs", batches.pairs_read());
    stats.set("HTO read pairs", fields.len());

    call_hto_library(plan, &fields, stats)
}

/// Counters of one splitting pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitSummary {
    /// Every read pair seen
    pub total: u64,
    /// Pairs written, indexed by sample
    pub per_sample: Vec<u64>,
    pub exact: u64,
    pub corrected: u64,
    pub ambiguous: u64,
    pub unmatched: u64,
}

impl SplitSummary {
    pub fn new(num_samples: usize) -> Self {
        Self { per_sample: vec![0; num_samples], ..Self::default() }
    }

    pub fn assigned(&self) -> u64 {
        self.per_sample.iter().sum()
    }
}

/// Process a chunk: resolve every barcode in parallel, then write the
/// matched pairs serially so each sample's files keep input order.
fn process_batch(
    batch: &PairBatch,
    barcode: &FieldPosition,
    resolver: &BarcodeResolver,
    writers: &mut [MatePairWriter],
    summary: &mut SplitSummary,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    // 1. Parallel compute
    let resolved: Vec<Resolution> = batch
        .r1
        .par_iter()
        .zip(batch.r2.par_iter())
        .enumerate()
        .map(|(i, (r1, r2))| {
            barcode
                .slice("cell_barcode", barcode.select(&r1.seq, &r2.seq))
                .map(|bc| resolver.resolve(bc))
                .map_err(|e| e.at_record(batch.first + i as u64))
        })
        .collect::<crate::error::Result<_>>()?;

    // 2. Serial write
    for ((r1, r2), resolution) in batch.r1.iter().zip(&batch.r2).zip(resolved) {
        summary.total += 1;
        match resolution {
            Resolution::Exact(_) => summary.exact += 1,
            Resolution::Corrected(_) => summary.corrected += 1,
            Resolution::Ambiguous => summary.ambiguous += 1,
            Resolution::Unmatched => summary.unmatched += 1,
        }
        let Some(sample) = resolution.sample() else {
            continue;
        };
        writers[sample].write_pair(r1, r2)?;
        summary.per_sample[sample] += 1;
    }
    Ok(())
}

/// Route every read pair of `batches` to the writer pair of the sample its
/// barcode resolves to. Unmatched and ambiguous pairs are counted and
/// dropped. Records are written as read, never with the corrected barcode.
pub fn split_pairs<I>(
    batches: I,
    barcode: &FieldPosition,
    resolver: &BarcodeResolver,
    writers: &mut [MatePairWriter],
    progress: &ProgressBar,
) -> Result<SplitSummary>
where
    I: Iterator<Item = crate::error::Result<PairBatch>>,
{
    let mut summary = SplitSummary::new(writers.len());
    for batch in batches {
        let batch = batch?;
        process_batch(&batch, barcode, resolver, writers, &mut summary)?;
        progress.inc(batch.len() as u64);
    }
    Ok(summary)
}

/// Split the GEX library of `plan` into per-sample files inside `out_dir`.
///
/// All outputs are created before the first chunk is read and finished once
/// after the last. If anything fails the partial outputs are deleted.
pub fn split_library(
    plan: &LibraryPlan,
    resolver: &BarcodeResolver,
    out_dir: &Path,
    batch_size: usize,
    progress: &ProgressBar,
) -> Result<SplitSummary> {
    info!("Splitting GEX library for {}: R1={}, R2={}", plan.name, plan.gex_r1.display(), plan.gex_r2.display());
    let mut batches = PairedBatches::open(&plan.gex_r1, &plan.gex_r2, batch_size)?;

    let mut writers = Vec::with_capacity(plan.htos.len());
    for (r1, r2) in sample_outputs(plan, out_dir) {
        match MatePairWriter::create(&r1, &r2) {
            Ok(w) => writers.push(w),
            Err(e) => {
                writers.into_iter().for_each(MatePairWriter::discard);
                return Err(e);
            }
        }
    }

    progress.set_message(format!("{} GEX", plan.name));
    progress.set_position(0);
    let summary = match split_pairs(&mut batches, &plan.positions.cell_barcode, resolver, &mut writers, progress) {
        Ok(summary) => summary,
        Err(e) => {
            warn!("Removing partial outputs of library {}", plan.name);
            writers.into_iter().for_each(MatePairWriter::discard);
            return Err(e);
        }
    };

    let mut finished = Ok(());
    for w in writers {
        let r = w.finish();
        if finished.is_ok() {
            finished = r;
        }
    }
    if let Err(e) = finished {
        remove_sample_outputs(plan, out_dir);
        return Err(e).context("Failed to finish output files");
    }
    Ok(summary)
}

/// `(R1, R2)` output paths of every sample of `plan`, in sample order.
fn sample_outputs(plan: &LibraryPlan, out_dir: &Path) -> Vec<(PathBuf, PathBuf)> {
    let file_type = plan.output_type();
    plan.htos.samples().iter().map(|sample| file_type.sample_paths(out_dir, sample)).collect()
}

/// Delete the per-sample FASTQ files of a library that did not complete.
fn remove_sample_outputs(plan: &LibraryPlan, out_dir: &Path) {
    warn!("Removing partial outputs of library {}", plan.name);
    for (r1, r2) in sample_outputs(plan, out_dir) {
        for path in [r1, r2] {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove partial output {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Statistics of one completed library.
#[derive(Debug, Clone)]
pub struct LibraryReport {
    pub name: String,
    pub statistics: Statistics,
    pub split: SplitSummary,
}

/// Process one library end to end, writing everything into
/// `{output_dir}/{library}/`.
pub fn process_library(
    plan: &LibraryPlan,
    output_dir: &Path,
    batch_size: usize,
    progress: &ProgressBar,
) -> Result<LibraryReport> {
    let out_dir = output_dir.join(&plan.name);
    fs::create_dir_all(&out_dir).with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let mut stats = Statistics::new();
    stats.set("Library name", &plan.name);

    let hto = process_hto_library(plan, batch_size, &mut stats, progress)?;
    write_ranked_table(&out_dir.join(format!("{}_ranked_barcodes.csv", plan.name)), &hto.ranked, &plan.htos)?;
    for (id, sample) in plan.htos.samples().iter().enumerate() {
        let path = out_dir.join(format!("{sample}_cell_barcodes.txt"));
        write_barcode_list(&path, hto.called.sample(id))?;
        info!("Wrote {} cell barcodes for sample {} to {}", hto.called.sample(id).len(), sample, path.display());
    }

    let resolver = BarcodeResolver::from_called(&hto.called);
    drop(hto);
    stats.set("Barcodes in exact lookup", resolver.num_exact());
    stats.set("Barcodes called in more than one sample", resolver.num_conflicts());
    stats.set("Correctable barcode variants", resolver.neighbors().len());
    stats.set("Ambiguous barcode variants", resolver.neighbors().num_ambiguous());

    stats.set("GEX R1 FASTQ", plan.gex_r1.display());
    stats.set("GEX R2 FASTQ", plan.gex_r2.display());
    let split = split_library(plan, &resolver, &out_dir, batch_size, progress)?;
    stats.set("GEX read pairs", split.total);
    stats.set("Assigned GEX read pairs", split.assigned());
    stats.set("Exact barcode matches", split.exact);
    stats.set("Corrected barcode matches", split.corrected);
    stats.set("Ambiguous barcodes", split.ambiguous);
    stats.set("Unmatched barcodes", split.unmatched);
    for (id, sample) in plan.htos.samples().iter().enumerate() {
        stats.set(format!("GEX read pairs of {sample}"), split.per_sample[id]);
    }

    if let Err(e) = stats.write_csv(&out_dir.join(format!("{}_statistics.csv", plan.name))) {
        remove_sample_outputs(plan, out_dir.as_path());
        return Err(e);
    }
    info!("Finished processing library {}", plan.name);
    Ok(LibraryReport { name: plan.name.clone(), statistics: stats, split })
}

/// Process every library in order, stopping at the first failure. Libraries
/// completed before the failure keep their outputs.
pub fn run(plan: &RunPlan, output_dir: &Path, batch_size: usize, quiet: bool) -> Result<Vec<LibraryReport>> {
    fs::create_dir_all(output_dir).with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let progress = make_progress_bar(quiet);
    let mut reports = Vec::with_capacity(plan.libraries.len());
    for library in &plan.libraries {
        let report = process_library(library, output_dir, batch_size, &progress)
            .with_context(|| format!("Failed to process library {}", library.name))?;
        reports.push(report);
    }
    progress.finish_and_clear();
    info!("Processing complete. Results are saved in: {}", output_dir.display());
    Ok(reports)
}

/// Whether `err` was caused by one of the typed demultiplexing errors.
pub fn demux_error(err: &anyhow::Error) -> Option<&DemuxError> {
    err.chain().find_map(|e| e.downcast_ref::<DemuxError>())
}
