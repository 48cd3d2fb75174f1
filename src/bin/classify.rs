use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{error, info};

use taxmatch::builder::{BuiltIndex, IndexFiles};
use taxmatch::config::MatchConfig;
use taxmatch::kmer_store::KmerStore;
use taxmatch::logging::init_logger;
use taxmatch::matcher::MatchContext;
use taxmatch::output::{OutputSinks, ThreadSafeOutput};
use taxmatch::reports::{report_stats, report_taxa};
use taxmatch::seqreader::BatchSequenceReader;
use taxmatch::taxonomy::{TaxId, TaxTree};
use taxmatch::threadpool::{ClassificationRun, RunReport};

/// Classify reads against a k-mer index built by build_db.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Options {
    /// Index directory written by build_db
    #[clap(short = 'H', long, value_parser)]
    index_dir: PathBuf,

    /// Taxonomy table (child<TAB>parent or nodes.dmp)
    #[clap(short, long, value_parser)]
    taxonomy_filename: PathBuf,

    /// JSON file with matching settings; flags override it
    #[clap(short = 'c', long, value_parser)]
    config: Option<PathBuf>,

    /// Per-taxon TSV report
    #[clap(short = 'R', long, value_parser)]
    report_filename: Option<PathBuf>,

    /// Copy of every classified read
    #[clap(short = 'C', long, value_parser)]
    classified_output_filename: Option<PathBuf>,

    /// Kraken-style per-read output (default: stdout)
    #[clap(short = 'O', long, value_parser)]
    kraken_output_filename: Option<PathBuf>,

    /// Suppress per-read output
    #[clap(long, action)]
    no_kraken_output: bool,

    /// Also print lines for unclassified reads
    #[clap(short = 'U', long, action)]
    print_unclassified: bool,

    /// Number of matcher threads (0 matches on the reader thread)
    #[clap(short = 'p', long, value_parser)]
    num_threads: Option<usize>,

    /// Reads per batch handed to a matcher thread
    #[clap(short = 'B', long, value_parser)]
    batch_size: Option<usize>,

    /// Longest read that is matched; longer reads are skipped
    #[clap(long, value_parser)]
    max_read_size: Option<usize>,

    /// Pre-filter: minimum Bloom-positive k-mers per read
    #[clap(long, value_parser)]
    min_pos_count: Option<usize>,

    /// Pre-filter: minimum fraction of Bloom-positive k-mers per read
    #[clap(long, value_parser)]
    pos_ratio: Option<f64>,

    /// Distinct taxa tracked per read
    #[clap(long, value_parser)]
    max_paths: Option<usize>,

    /// Write a copy of the store without entries hit fewer than --prune-min times
    #[clap(long, value_parser)]
    prune_store: Option<PathBuf>,

    #[clap(long, default_value_t = 1, value_parser)]
    prune_min: u8,

    /// Log progress information
    #[clap(short, long, action)]
    verbose: bool,

    /// Read files (FASTA/FASTQ, optionally gzipped); stdin when absent
    #[clap(value_parser)]
    input_files: Vec<PathBuf>,
}

fn match_config(opts: &Options) -> Result<MatchConfig> {
    let mut config = match &opts.config {
        Some(path) => MatchConfig::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => MatchConfig {
            threads: num_cpus::get(),
            ..Default::default()
        },
    };
    if let Some(threads) = opts.num_threads {
        config.threads = threads;
    }
    if let Some(batch_size) = opts.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(max_read_size) = opts.max_read_size {
        config.max_read_size = max_read_size;
    }
    if let Some(min_pos_count) = opts.min_pos_count {
        config.min_pos_count = min_pos_count;
    }
    if let Some(pos_ratio) = opts.pos_ratio {
        config.pos_ratio = pos_ratio;
    }
    if let Some(max_paths) = opts.max_paths {
        config.max_paths = max_paths;
    }
    if opts.no_kraken_output {
        config.write_kraken_output = false;
    }
    if opts.print_unclassified {
        config.write_unclassified = true;
    }
    if opts.prune_store.is_some() {
        config.record_hit_slots = true;
    }
    config.validate()?;
    Ok(config)
}

fn feed_reads(run: &mut ClassificationRun, inputs: &[PathBuf], batch_size: usize) -> Result<u64> {
    let progress = atty::is(atty::Stream::Stderr);
    let mut submitted = 0u64;
    for path in inputs {
        let mut reader = BatchSequenceReader::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        loop {
            let batch = reader
                .next_batch(batch_size)
                .with_context(|| format!("reading {}", path.display()))?;
            if batch.is_empty() {
                break;
            }
            submitted += batch.len() as u64;
            run.submit(batch)?;
            if progress {
                eprint!("\rProcessed {} sequences", submitted);
            }
        }
    }
    Ok(submitted)
}

fn main() -> Result<()> {
    let opts = Options::parse();
    init_logger(opts.verbose);
    let config = match_config(&opts)?;

    info!("loading index from {}", opts.index_dir.display());
    let files = IndexFiles::in_dir(&opts.index_dir);
    let (index_config, store, filter) = BuiltIndex::load(&files)
        .with_context(|| format!("loading index from {}", opts.index_dir.display()))?;
    let taxonomy = TaxTree::from_file(&opts.taxonomy_filename).with_context(|| {
        format!("loading taxonomy from {}", opts.taxonomy_filename.display())
    })?;
    info!(
        "index: k={}, {} k-mers, {} taxa; {} threads",
        index_config.k,
        store.len(),
        store.values().len(),
        config.threads
    );

    let kraken = if config.write_kraken_output {
        let path = opts
            .kraken_output_filename
            .clone()
            .unwrap_or_else(|| PathBuf::from("-"));
        Some(ThreadSafeOutput::create(&path).with_context(|| format!("creating {}", path.display()))?)
    } else {
        None
    };
    let classified = opts
        .classified_output_filename
        .as_deref()
        .map(|path| {
            ThreadSafeOutput::create(path).with_context(|| format!("creating {}", path.display()))
        })
        .transpose()?;

    let store = Arc::new(store);
    let batch_size = config.batch_size;
    let ctx = MatchContext::new(
        Arc::clone(&store),
        Arc::new(taxonomy),
        config,
        OutputSinks { kraken, classified },
    )?
    .with_prefilter(Arc::new(filter))?;

    let start_time = Instant::now();
    let mut run = ClassificationRun::start(ctx)?;
    let inputs = if opts.input_files.is_empty() {
        vec![PathBuf::from("-")]
    } else {
        opts.input_files.clone()
    };
    if let Err(e) = feed_reads(&mut run, &inputs, batch_size) {
        let report = run.abort();
        for worker_error in &report.errors {
            error!("{:#}", worker_error);
        }
        return Err(e);
    }
    let report = run.finish();
    report_stats(start_time.elapsed().as_secs_f64(), &report.totals);

    for worker_error in &report.errors {
        error!("{:#}", worker_error);
    }
    if let Some(path) = &opts.report_filename {
        report_taxa(path, &report)?;
    }
    if let Some(path) = &opts.prune_store {
        prune_store(store, &report, opts.prune_min, path)?;
    }
    if !report.errors.is_empty() {
        bail!("{} batches failed", report.errors.len());
    }
    Ok(())
}

fn prune_store(
    store: Arc<KmerStore<TaxId>>,
    report: &RunReport,
    min_count: u8,
    path: &Path,
) -> Result<()> {
    let mut store =
        Arc::try_unwrap(store).map_err(|_| anyhow!("k-mer store is still shared"))?;
    let touched = report.apply_hit_counts(&mut store)?;
    let excluded = store.exclude_below(min_count)?;
    store
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!(
        "{} k-mers confirmed by reads, {} excluded, pruned store written to {}",
        touched,
        excluded,
        path.display()
    );
    Ok(())
}
