//! Per-read k-mer matching.
//!
//! A read is scanned window by window on the forward strand. Only when no
//! window hits the store is it scanned again using the reverse-complement
//! keys. Consecutive windows resolving to the same taxon form a contig.
//!
//! Hit taxa are folded into candidate paths: a hit on a descendant of a
//! path's tip deepens that path, a hit on an ancestor is already covered by
//! it. A candidate scores every hit on its lineage, root to tip.

use std::fmt::Write as _;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::bloom::BloomFilter;
use crate::cgat::KmerWindows;
use crate::config::MatchConfig;
use crate::errors::{KmerError, Result};
use crate::kmer_store::KmerStore;
use crate::output::OutputSinks;
use crate::prefilter::ReadPrefilter;
use crate::seqreader::ReadRecord;
use crate::stats::{SlotBits, StatsTable, TaxonDelta};
use crate::taxonomy::{TaxId, TaxNode, TaxonomyOracle};

/// Token used for windows that contain a non-CGAT base.
const AMBIGUOUS_SPAN_TOKEN: &str = "A";
const UNCLASSIFIED_TOKEN: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Start,
    ScanForward,
    ScanReverse,
    Classified,
    Unclassified,
    /// Longer than `max_read_size`.
    Skipped,
    /// Rejected by the Bloom pre-filter.
    Filtered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strand {
    Forward,
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub state: ReadState,
    pub label: Option<TaxId>,
    pub hit_kmers: u32,
}

/// Run-wide read counters.
#[derive(Debug, Default)]
pub struct RunCounters {
    reads: AtomicU64,
    classified: AtomicU64,
    unclassified: AtomicU64,
    skipped_reads: AtomicU64,
    filtered_reads: AtomicU64,
    bases: AtomicU64,
    invalid_windows: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub reads: u64,
    pub classified: u64,
    pub unclassified: u64,
    pub skipped_reads: u64,
    pub filtered_reads: u64,
    pub bases: u64,
    pub invalid_windows: u64,
}

impl RunCounters {
    pub fn totals(&self) -> RunTotals {
        RunTotals {
            reads: self.reads.load(Ordering::Relaxed),
            classified: self.classified.load(Ordering::Relaxed),
            unclassified: self.unclassified.load(Ordering::Relaxed),
            skipped_reads: self.skipped_reads.load(Ordering::Relaxed),
            filtered_reads: self.filtered_reads.load(Ordering::Relaxed),
            bases: self.bases.load(Ordering::Relaxed),
            invalid_windows: self.invalid_windows.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Everything the workers of one run share. Built once, then read through
/// an `Arc`; all mutation goes through locks or atomics.
pub struct MatchContext {
    pub store: Arc<KmerStore<TaxId>>,
    pub taxonomy: Arc<dyn TaxonomyOracle>,
    pub config: MatchConfig,
    pub outputs: OutputSinks,
    prefilter: Option<(Arc<BloomFilter>, ReadPrefilter)>,
    // taxonomy node per store value index
    value_nodes: Vec<Option<TaxNode>>,
    pub stats: StatsTable,
    pub unique_slots: Option<SlotBits>,
    pub hit_slots: Option<SlotBits>,
    pub counters: RunCounters,
}

impl MatchContext {
    pub fn new(
        store: Arc<KmerStore<TaxId>>,
        taxonomy: Arc<dyn TaxonomyOracle>,
        config: MatchConfig,
        outputs: OutputSinks,
    ) -> Result<Self> {
        config.validate()?;
        let slot_bits = |enabled: bool| enabled.then(|| SlotBits::new(store.len()));
        let value_nodes = store
            .values()
            .iter()
            .map(|taxid| taxonomy.node_of(taxid))
            .collect();
        Ok(MatchContext {
            unique_slots: slot_bits(config.count_unique_kmers),
            hit_slots: slot_bits(config.record_hit_slots),
            store,
            taxonomy,
            config,
            outputs,
            prefilter: None,
            value_nodes,
            stats: StatsTable::new(),
            counters: RunCounters::default(),
        })
    }

    /// Screens reads with `filter` using the configured thresholds. Without
    /// thresholds the filter is ignored.
    pub fn with_prefilter(mut self, filter: Arc<BloomFilter>) -> Result<Self> {
        if filter.k() != self.store.k() {
            return Err(KmerError::KMismatch {
                expected: self.store.k(),
                found: filter.k(),
            });
        }
        let screen = ReadPrefilter::new(self.config.min_pos_count, self.config.pos_ratio);
        if screen.is_active() {
            self.prefilter = Some((filter, screen));
        }
        Ok(self)
    }

    /// Whether the taxon at `ancestor` lies on the lineage of the taxon at
    /// `index`, itself included. Taxa missing from the taxonomy only match
    /// themselves.
    fn on_lineage(&self, index: u16, ancestor: u16) -> bool {
        if index == ancestor {
            return true;
        }
        let node = |i: u16| self.value_nodes.get(i as usize).copied().flatten();
        match (node(index), node(ancestor)) {
            (Some(node), Some(ancestor)) => self.taxonomy.is_ancestor_of(node, ancestor),
            _ => false,
        }
    }
}

/// Reusable per-worker scratch state for classifying reads.
#[derive(Debug)]
pub struct ReadMatcher {
    state: ReadState,
    tally: Vec<(u16, TaxonDelta)>,
    // tips of the candidate paths, pairwise unrelated
    paths: Vec<u16>,
    hit_count: u32,
    // Some(None) is an open contig of misses
    contig: Option<Option<u16>>,
    contig_len: u32,
    tokens: String,
    kraken_buffer: String,
    classified_buffer: Vec<u8>,
}

impl Default for ReadMatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn delta_for(tally: &mut Vec<(u16, TaxonDelta)>, index: u16) -> &mut TaxonDelta {
    let pos = match tally.iter().position(|(i, _)| *i == index) {
        Some(pos) => pos,
        None => {
            tally.push((index, TaxonDelta::default()));
            tally.len() - 1
        }
    };
    &mut tally[pos].1
}

impl ReadMatcher {
    pub fn new() -> Self {
        ReadMatcher {
            state: ReadState::Start,
            tally: Vec::new(),
            paths: Vec::new(),
            hit_count: 0,
            contig: None,
            contig_len: 0,
            tokens: String::new(),
            kraken_buffer: String::new(),
            classified_buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    fn reset_scan(&mut self) {
        self.tally.clear();
        self.paths.clear();
        self.hit_count = 0;
        self.contig = None;
        self.contig_len = 0;
        self.tokens.clear();
    }

    fn push_token(&mut self, taxon: &str, len: usize) {
        if !self.tokens.is_empty() {
            self.tokens.push(' ');
        }
        let _ = write!(self.tokens, "{}:{}", taxon, len);
    }

    fn close_contig(&mut self, ctx: &MatchContext) {
        let Some(taxon) = self.contig.take() else {
            return;
        };
        let len = std::mem::take(&mut self.contig_len);
        if let Some(index) = taxon {
            let delta = delta_for(&mut self.tally, index);
            delta.contigs += 1;
            delta.max_contig_len = delta.max_contig_len.max(len);
        }
        if ctx.config.write_kraken_output {
            let id = taxon
                .and_then(|index| ctx.store.value(index))
                .map_or(UNCLASSIFIED_TOKEN, String::as_str);
            self.push_token(id, len as usize);
        }
    }

    fn record_hit(&mut self, ctx: &MatchContext, slot: usize, index: u16) {
        self.hit_count += 1;
        let delta = delta_for(&mut self.tally, index);
        delta.kmers += 1;
        if let Some(bits) = &ctx.unique_slots {
            if bits.set(slot) {
                delta.unique_kmers += 1;
            }
        }
        if let Some(bits) = &ctx.hit_slots {
            bits.set(slot);
        }
        if self.paths.iter().any(|&tip| ctx.on_lineage(tip, index)) {
            return;
        }
        match self.paths.iter().position(|&tip| ctx.on_lineage(index, tip)) {
            Some(pos) => self.paths[pos] = index,
            None if self.paths.len() < ctx.config.max_paths => self.paths.push(index),
            None => {}
        }
    }

    /// Hits on the lineage of `tip`, from the root down to the tip itself.
    fn path_score(&self, ctx: &MatchContext, tip: u16) -> u64 {
        self.tally
            .iter()
            .filter(|(index, _)| ctx.on_lineage(tip, *index))
            .map(|(_, delta)| delta.kmers)
            .sum()
    }

    /// Scans all windows of `bases` on one strand. Returns the number of
    /// window positions skipped because of invalid bases.
    fn scan(&mut self, ctx: &MatchContext, bases: &[u8], strand: Strand) -> usize {
        self.reset_scan();
        let windows = KmerWindows::new(bases, ctx.store.k());
        let window_count = windows.window_count();
        let mut expected = 0;
        let mut invalid = 0;
        for window in windows {
            if window.offset > expected {
                self.close_contig(ctx);
                let gap = window.offset - expected;
                invalid += gap;
                if ctx.config.write_kraken_output {
                    self.push_token(AMBIGUOUS_SPAN_TOKEN, gap);
                }
            }
            expected = window.offset + 1;

            let key = match strand {
                Strand::Forward => window.straight,
                Strand::Reverse => window.reverse,
            };
            let hit = ctx.store.lookup(key);
            let taxon = hit.map(|(_, index)| index);
            if self.contig != Some(taxon) {
                self.close_contig(ctx);
                self.contig = Some(taxon);
            }
            self.contig_len += 1;
            if let Some((slot, index)) = hit {
                self.record_hit(ctx, slot, index);
            }
        }
        self.close_contig(ctx);
        if window_count > expected {
            let gap = window_count - expected;
            invalid += gap;
            if ctx.config.write_kraken_output {
                self.push_token(AMBIGUOUS_SPAN_TOKEN, gap);
            }
        }
        invalid
    }

    /// Highest-scoring candidate path; ties go to the lowest common ancestor
    /// of the tied tips.
    fn resolve_label(&self, ctx: &MatchContext) -> Option<TaxId> {
        let scores: Vec<(u16, u64)> = self
            .paths
            .iter()
            .map(|&tip| (tip, self.path_score(ctx, tip)))
            .collect();
        let best = scores.iter().map(|(_, score)| *score).max()?;
        let mut tied = scores
            .iter()
            .filter(|(_, score)| *score == best)
            .filter_map(|(tip, _)| ctx.store.value(*tip));
        let mut label = tied.next()?.clone();
        for other in tied {
            label = ctx.taxonomy.lca_of_ids(&label, other).unwrap_or(label);
        }
        Some(label)
    }

    /// Classifies one read. Output lines are buffered until
    /// [`flush_outputs`](Self::flush_outputs).
    pub fn classify(&mut self, ctx: &MatchContext, read: &ReadRecord) -> ReadOutcome {
        self.state = ReadState::Start;
        bump(&ctx.counters.reads, 1);
        bump(&ctx.counters.bases, read.len() as u64);

        if read.len() > ctx.config.max_read_size {
            bump(&ctx.counters.skipped_reads, 1);
            return self.finish_early(ReadState::Skipped);
        }
        if let Some((filter, screen)) = &ctx.prefilter {
            if !screen.accepts(filter, &read.bases) {
                bump(&ctx.counters.filtered_reads, 1);
                return self.finish_early(ReadState::Filtered);
            }
        }

        self.state = ReadState::ScanForward;
        let invalid = self.scan(ctx, &read.bases, Strand::Forward);
        bump(&ctx.counters.invalid_windows, invalid as u64);
        if self.hit_count == 0 {
            self.state = ReadState::ScanReverse;
            self.scan(ctx, &read.bases, Strand::Reverse);
        }

        for (index, delta) in &self.tally {
            ctx.stats.apply(*index, delta, &read.descriptor);
        }

        let label = self.resolve_label(ctx);
        self.state = if label.is_some() {
            bump(&ctx.counters.classified, 1);
            ReadState::Classified
        } else {
            bump(&ctx.counters.unclassified, 1);
            ReadState::Unclassified
        };
        self.buffer_outputs(ctx, read, label.as_deref());

        ReadOutcome {
            state: self.state,
            label,
            hit_kmers: self.hit_count,
        }
    }

    fn finish_early(&mut self, state: ReadState) -> ReadOutcome {
        self.reset_scan();
        self.state = state;
        ReadOutcome {
            state,
            label: None,
            hit_kmers: 0,
        }
    }

    fn buffer_outputs(&mut self, ctx: &MatchContext, read: &ReadRecord, label: Option<&str>) {
        if ctx.config.write_kraken_output
            && ctx.outputs.kraken.is_some()
            && (label.is_some() || ctx.config.write_unclassified)
        {
            let tokens = if self.tokens.is_empty() {
                "0:0"
            } else {
                self.tokens.as_str()
            };
            let _ = writeln!(
                self.kraken_buffer,
                "{}\t{}\t{}\t{}\t{}",
                if label.is_some() { 'C' } else { 'U' },
                String::from_utf8_lossy(read.id()),
                label.unwrap_or(UNCLASSIFIED_TOKEN),
                read.len(),
                tokens
            );
        }
        if label.is_some() && ctx.outputs.classified.is_some() {
            // Vec<u8> writes are infallible
            let _ = read.write_to(&mut self.classified_buffer);
        }
    }

    /// Writes buffered lines, one lock acquisition per sink.
    pub fn flush_outputs(&mut self, ctx: &MatchContext) -> io::Result<()> {
        if let Some(out) = &ctx.outputs.kraken {
            if !self.kraken_buffer.is_empty() {
                out.write_str(&self.kraken_buffer)?;
            }
        }
        if let Some(out) = &ctx.outputs.classified {
            if !self.classified_buffer.is_empty() {
                out.write_all(&self.classified_buffer)?;
            }
        }
        self.kraken_buffer.clear();
        self.classified_buffer.clear();
        Ok(())
    }

    pub fn process_batch(&mut self, ctx: &MatchContext, batch: &[ReadRecord]) -> io::Result<()> {
        for read in batch {
            self.classify(ctx, read);
        }
        self.flush_outputs(ctx)
    }
}
