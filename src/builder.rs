//! Index construction.
//!
//! Pass one inserts every reference k-mer under the taxon of the first
//! reference it was seen in. After the store is sorted, pass two revisits
//! every k-mer and moves it to the lowest common ancestor of all taxa
//! sharing it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::big_array::check_block_bits;
use crate::bloom::BloomFilter;
use crate::cgat::KmerWindows;
use crate::config::IndexConfig;
use crate::errors::{KmerError, Result};
use crate::kmer_store::KmerStore;
use crate::seqreader::{BatchSequenceReader, ReadRecord};
use crate::taxonomy::{TaxId, TaxonomyOracle};

/// Reads a `sequence-id<TAB>taxid` table.
pub fn read_id_to_taxon_map<P: AsRef<Path>>(path: P) -> Result<HashMap<String, TaxId>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut id_map = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split('\t');
        match (fields.next(), fields.next()) {
            (Some(seq_id), Some(taxid)) if !taxid.trim().is_empty() => {
                id_map.insert(seq_id.trim().to_string(), taxid.trim().to_string());
            }
            _ => return Err(KmerError::format(path, format!("bad id map line '{}'", line))),
        }
    }
    Ok(id_map)
}

/// File layout of a persisted index inside one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFiles {
    pub config: PathBuf,
    pub store: PathBuf,
    pub filter: PathBuf,
}

impl IndexFiles {
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        IndexFiles {
            config: dir.join("index.json"),
            store: dir.join("kmers.store"),
            filter: dir.join("kmers.bloom"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub references: usize,
    pub unmapped_references: usize,
    pub windows: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub promoted: u64,
}

pub struct BuiltIndex {
    pub config: IndexConfig,
    pub store: KmerStore<TaxId>,
    /// Standalone filter over all reference k-mers, used to pre-screen reads.
    pub filter: BloomFilter,
    pub summary: BuildSummary,
}

impl BuiltIndex {
    pub fn save(&self, files: &IndexFiles) -> Result<()> {
        self.config.save(&files.config)?;
        self.store.save(&files.store)?;
        self.filter.save(&files.filter)?;
        info!(
            "saved index ({} k-mers) to {}",
            self.store.len(),
            files.store.display()
        );
        Ok(())
    }

    /// Loads an index; both binary files must agree with the stored k.
    pub fn load(files: &IndexFiles) -> Result<(IndexConfig, KmerStore<TaxId>, BloomFilter)> {
        let config = IndexConfig::load(&files.config)?;
        let store = KmerStore::load(&files.store, config.k)?;
        let filter = BloomFilter::load(&files.filter, config.k)?;
        Ok((config, store, filter))
    }
}

struct Reference {
    taxid: TaxId,
    bases: Vec<u8>,
}

pub struct IndexBuilder<'a> {
    config: IndexConfig,
    taxonomy: &'a dyn TaxonomyOracle,
    block_bits: Option<u32>,
    references: Vec<Reference>,
    unmapped: usize,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(config: IndexConfig, taxonomy: &'a dyn TaxonomyOracle) -> Result<Self> {
        config.validate()?;
        Ok(IndexBuilder {
            config,
            taxonomy,
            block_bits: None,
            references: Vec::new(),
            unmapped: 0,
        })
    }

    /// Forces a storage block size for store and filter, mainly to exercise
    /// the blocked layout on small inputs.
    pub fn with_block_bits(mut self, block_bits: u32) -> Result<Self> {
        check_block_bits(block_bits)?;
        self.block_bits = Some(block_bits);
        Ok(self)
    }

    pub fn add_reference(&mut self, taxid: &str, bases: &[u8]) {
        if self.taxonomy.node_of(taxid).is_none() {
            warn!("taxid {} not in taxonomy, shared k-mers will not be promoted", taxid);
        }
        self.references.push(Reference {
            taxid: taxid.to_string(),
            bases: bases.to_vec(),
        });
    }

    /// Adds every record of a FASTA/FASTQ file whose id is in `id_map`.
    pub fn add_sequences<P: AsRef<Path>>(
        &mut self,
        path: P,
        id_map: &HashMap<String, TaxId>,
    ) -> Result<usize> {
        let mut reader = BatchSequenceReader::open(path.as_ref())?;
        let mut record = ReadRecord::default();
        let mut added = 0;
        while reader.next_sequence(&mut record)? {
            let id = String::from_utf8_lossy(record.id()).into_owned();
            match id_map.get(&id) {
                Some(taxid) => {
                    self.add_reference(taxid, &record.bases);
                    added += 1;
                }
                None => {
                    debug!("no taxid for sequence {}", id);
                    self.unmapped += 1;
                }
            }
        }
        info!("added {} references from {}", added, path.as_ref().display());
        Ok(added)
    }

    pub fn build(self) -> Result<BuiltIndex> {
        let k = self.config.k;
        let strategy = self.config.hash_strategy();
        let keys: Vec<Vec<u64>> = self
            .references
            .par_iter()
            .map(|r| KmerWindows::new(&r.bases, k).map(|w| w.straight).collect())
            .collect();
        let windows: u64 = keys.iter().map(|k| k.len() as u64).sum();
        let capacity = if self.config.expected_insertions > 0 {
            self.config.expected_insertions
        } else {
            windows.max(1)
        };
        info!(
            "building index: {} references, {} windows, capacity {}",
            self.references.len(),
            windows,
            capacity
        );

        let mut store = KmerStore::new(k, self.config.fpp)?.with_hash_strategy(strategy)?;
        let mut filter = BloomFilter::empty(k, self.config.fpp, strategy)?;
        if let Some(bits) = self.block_bits {
            store = store.with_block_bits(bits)?;
            filter = filter.with_block_bits(bits)?;
        }
        store.init_size(capacity as usize)?;
        filter.ensure_capacity(capacity)?;

        let mut summary = BuildSummary {
            references: self.references.len(),
            unmapped_references: self.unmapped,
            windows,
            ..Default::default()
        };
        for (reference, keys) in self.references.iter().zip(&keys) {
            for &key in keys {
                filter.insert(key)?;
                if store.put(key, reference.taxid.clone())? {
                    summary.inserted += 1;
                } else {
                    summary.duplicates += 1;
                }
            }
        }
        store.optimize()?;

        let taxonomy = self.taxonomy;
        for (reference, keys) in self.references.iter().zip(&keys) {
            for &key in keys {
                let mut promoted = false;
                store.update(key, |old| {
                    if *old == reference.taxid {
                        return old.clone();
                    }
                    match taxonomy.lca_of_ids(old, &reference.taxid) {
                        Some(lca) if lca != *old => {
                            promoted = true;
                            lca
                        }
                        _ => old.clone(),
                    }
                })?;
                if promoted {
                    summary.promoted += 1;
                }
            }
        }
        info!(
            "index built: {} k-mers, {} duplicates, {} promoted to a common ancestor",
            summary.inserted, summary.duplicates, summary.promoted
        );

        Ok(BuiltIndex {
            config: self.config,
            store,
            filter,
            summary,
        })
    }
}
