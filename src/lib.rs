// codec and storage
pub mod big_array;
pub mod bloom;
pub mod cgat;
pub mod kmer_store;
pub mod persist;
pub mod utilities;

// taxonomy and input
pub mod seqreader;
pub mod taxonomy;

// classification
pub mod matcher;
pub mod output;
pub mod prefilter;
pub mod stats;
pub mod threadpool;

// index construction
pub mod builder;

pub mod config;
pub mod errors;
pub mod logging;
pub mod reports;

pub use errors::{KmerError, Result};
