use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use schto::config::Config;
use schto::percent;
use schto::processing::{run, DEFAULT_BATCH_SIZE};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Demultiplex hashtag-labelled single-cell libraries into per-sample FASTQ files"
)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory; one sub-directory is created per library
    #[arg(short, long)]
    output: PathBuf,

    /// Number of threads for parallel processing
    #[arg(short, long, default_value_t = 6)]
    threads: usize,

    /// Read pairs decoded per chunk
    #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    chunk_size: usize,

    /// Verbose output (debug logging, progress and elapsed time)
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

/// CLI entry point: parse args, validate the configuration, configure
/// threading and process every library. Prints one tab-separated line per
/// library: library, gex_pairs, assigned, percent_assigned.
fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let plan = Config::load(&args.input)?.validate()?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build_global()?;
    info!("Using {} threads, {} read pairs per chunk", args.threads, args.chunk_size);

    let start = std::time::Instant::now();
    let reports = run(&plan, &args.output, args.chunk_size, !args.verbose)?;
    let elapsed = start.elapsed();

    for report in &reports {
        let assigned = report.split.assigned();
        println!(
            "{}\t{}\t{}\t{:.2}",
            report.name,
            report.split.total,
            assigned,
            percent(assigned, report.split.total)
        );
    }

    if args.verbose {
        println!("Elapsed: {:.3}s", elapsed.as_secs_f64());
    }

    Ok(())
}
