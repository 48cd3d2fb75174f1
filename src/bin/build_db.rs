use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use taxmatch::builder::{read_id_to_taxon_map, IndexBuilder, IndexFiles};
use taxmatch::config::IndexConfig;
use taxmatch::logging::init_logger;
use taxmatch::reports::report_build;
use taxmatch::taxonomy::TaxTree;

/// Build a sorted k-mer index and Bloom filter from reference sequences.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Options {
    /// Output directory for the index files
    #[clap(short = 'o', long, value_parser)]
    output_dir: PathBuf,

    /// Taxonomy table (child<TAB>parent or nodes.dmp)
    #[clap(short, long, value_parser)]
    taxonomy_filename: PathBuf,

    /// Sequence ID to taxon map (seqid<TAB>taxid)
    #[clap(short = 'm', long, value_parser)]
    id_map_filename: PathBuf,

    /// JSON file with index settings; flags override it
    #[clap(short = 'c', long, value_parser)]
    config: Option<PathBuf>,

    /// Length of k-mers
    #[clap(short = 'k', long, value_parser)]
    kmer_len: Option<usize>,

    /// Expected number of distinct k-mers (default: count of reference k-mers)
    #[clap(short = 'n', long, value_parser)]
    expected_insertions: Option<u64>,

    /// Bloom filter false positive probability
    #[clap(long, value_parser)]
    fpp: Option<f64>,

    /// Hash whole k-mers instead of even/odd halves
    #[clap(long, action)]
    direct_hash: bool,

    /// Number of threads used to encode references
    #[clap(short = 'p', long, value_parser)]
    num_threads: Option<usize>,

    /// Log progress information
    #[clap(short, long, action)]
    verbose: bool,

    /// Reference FASTA/FASTQ files, optionally gzipped
    #[clap(value_parser, required = true)]
    input_files: Vec<PathBuf>,
}

fn index_config(opts: &Options) -> Result<IndexConfig> {
    let mut config = match &opts.config {
        Some(path) => IndexConfig::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => IndexConfig::default(),
    };
    if let Some(k) = opts.kmer_len {
        config.k = k;
    }
    if let Some(n) = opts.expected_insertions {
        config.expected_insertions = n;
    }
    if let Some(fpp) = opts.fpp {
        config.fpp = fpp;
    }
    if opts.direct_hash {
        config.two_hash = false;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let opts = Options::parse();
    init_logger(opts.verbose);
    let config = index_config(&opts)?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(opts.num_threads.unwrap_or_else(num_cpus::get))
        .build_global()
        .context("configuring thread pool")?;

    let start_time = Instant::now();
    let taxonomy = TaxTree::from_file(&opts.taxonomy_filename).with_context(|| {
        format!("loading taxonomy from {}", opts.taxonomy_filename.display())
    })?;
    let id_map = read_id_to_taxon_map(&opts.id_map_filename).with_context(|| {
        format!("loading id map from {}", opts.id_map_filename.display())
    })?;
    info!("{} sequence ids mapped to taxa", id_map.len());

    let mut builder = IndexBuilder::new(config, &taxonomy)?;
    for path in &opts.input_files {
        builder
            .add_sequences(path, &id_map)
            .with_context(|| format!("reading {}", path.display()))?;
    }
    let index = builder.build()?;

    std::fs::create_dir_all(&opts.output_dir)
        .with_context(|| format!("creating {}", opts.output_dir.display()))?;
    index.save(&IndexFiles::in_dir(&opts.output_dir))?;

    report_build(&index.summary);
    eprintln!(
        "Index written to {} in {:.3}s.",
        opts.output_dir.display(),
        start_time.elapsed().as_secs_f64()
    );
    Ok(())
}
