use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bloom::HashStrategy;
use crate::errors::{check_k, KmerError, Result};

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| KmerError::format(path, e.to_string()))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value).map_err(|e| KmerError::format(path, e.to_string()))
}

/// Parameters fixed when an index is built. Written next to the index so
/// classification uses the same k.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub k: usize,
    /// 0 sizes the index from the reference k-mer count.
    pub expected_insertions: u64,
    pub fpp: f64,
    pub two_hash: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            k: 31,
            expected_insertions: 0,
            fpp: 0.001,
            two_hash: true,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        check_k(self.k)?;
        if !(self.fpp > 0.0 && self.fpp < 1.0) {
            return Err(KmerError::InvalidFpp(self.fpp));
        }
        Ok(())
    }

    pub fn hash_strategy(&self) -> HashStrategy {
        if self.two_hash {
            HashStrategy::TwoHash
        } else {
            HashStrategy::Direct
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(path.as_ref(), self)
    }
}

/// Knobs of one classification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Worker threads; 0 matches on the submitting thread.
    pub threads: usize,
    /// Batches buffered between the reader and the workers.
    pub queue_depth: usize,
    pub batch_size: usize,
    /// Longer reads are skipped and counted.
    pub max_read_size: usize,
    /// Bloom pre-filter: minimum number of positive windows (0 disables).
    pub min_pos_count: usize,
    /// Bloom pre-filter: minimum fraction of positive windows (0 disables).
    pub pos_ratio: f64,
    /// Distinct taxa tracked per read when picking its label.
    pub max_paths: usize,
    pub write_kraken_output: bool,
    pub write_unclassified: bool,
    pub count_unique_kmers: bool,
    pub record_hit_slots: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        MatchConfig {
            threads: 1,
            queue_depth: 64,
            batch_size: 10_000,
            max_read_size: 100_000,
            min_pos_count: 0,
            pos_ratio: 0.0,
            max_paths: 5,
            write_kraken_output: true,
            write_unclassified: false,
            count_unique_kmers: true,
            record_hit_slots: false,
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(KmerError::InvalidConfig("queue_depth must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(KmerError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.max_read_size == 0 {
            return Err(KmerError::InvalidConfig("max_read_size must be positive".into()));
        }
        if self.max_paths == 0 {
            return Err(KmerError::InvalidConfig("max_paths must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.pos_ratio) {
            return Err(KmerError::InvalidConfig(format!(
                "pos_ratio {} outside [0, 1]",
                self.pos_ratio
            )));
        }
        Ok(())
    }

    pub fn uses_prefilter(&self) -> bool {
        self.min_pos_count > 0 || self.pos_ratio > 0.0
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        IndexConfig::default().validate().unwrap();
        MatchConfig::default().validate().unwrap();
        assert!(!MatchConfig::default().uses_prefilter());
    }

    #[test]
    fn test_index_validation() {
        let bad_k = IndexConfig {
            k: 32,
            ..Default::default()
        };
        assert!(matches!(bad_k.validate(), Err(KmerError::InvalidK(32))));
        let bad_fpp = IndexConfig {
            fpp: 1.0,
            ..Default::default()
        };
        assert!(matches!(bad_fpp.validate(), Err(KmerError::InvalidFpp(_))));
    }

    #[test]
    fn test_match_validation() {
        for config in [
            MatchConfig {
                max_paths: 0,
                ..Default::default()
            },
            MatchConfig {
                queue_depth: 0,
                ..Default::default()
            },
            MatchConfig {
                pos_ratio: 1.5,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(KmerError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_partial_json() {
        let config: MatchConfig =
            serde_json::from_str(r#"{"threads": 4, "pos_ratio": 0.2}"#).unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.pos_ratio, 0.2);
        assert_eq!(config.max_paths, MatchConfig::default().max_paths);
        assert!(config.uses_prefilter());
    }

    #[test]
    fn test_index_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let config = IndexConfig {
            k: 21,
            two_hash: false,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = IndexConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.hash_strategy(), HashStrategy::Direct);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            IndexConfig::load(&path),
            Err(KmerError::Format { .. })
        ));
    }
}
