use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{anyhow, Context};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};

use crate::errors::Result;
use crate::kmer_store::KmerStore;
use crate::matcher::{MatchContext, ReadMatcher, RunTotals};
use crate::seqreader::ReadRecord;
use crate::stats::{SlotBits, TaxonStats};
use crate::taxonomy::TaxId;

type Batch = Vec<ReadRecord>;

/// Statistics of one taxon at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonReport {
    pub taxid: TaxId,
    pub stats: TaxonStats,
}

/// Everything a finished run leaves behind.
#[derive(Debug)]
pub struct RunReport {
    pub totals: RunTotals,
    /// Ordered by the store's value index.
    pub taxa: Vec<TaxonReport>,
    pub hit_slots: Option<SlotBits>,
    pub errors: Vec<anyhow::Error>,
}

impl RunReport {
    pub fn taxon(&self, taxid: &str) -> Option<&TaxonStats> {
        self.taxa
            .iter()
            .find(|t| t.taxid == taxid)
            .map(|t| &t.stats)
    }

    /// Bumps the counter of every store entry hit during the run, so that
    /// `exclude_below` can later mask entries no read confirmed.
    pub fn apply_hit_counts<V>(&self, store: &mut KmerStore<V>) -> Result<usize>
    where
        V: Clone + Eq + std::hash::Hash,
    {
        let Some(bits) = &self.hit_slots else {
            return Ok(0);
        };
        store.enable_counters()?;
        let len = store.len();
        let mut touched = 0;
        for slot in bits.iter_ones().take_while(|&slot| slot < len) {
            store.increment_counter(slot)?;
            touched += 1;
        }
        Ok(touched)
    }
}

struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Processes one batch, turning I/O failures and panics into collected
/// errors instead of killing the worker.
fn run_batch(
    matcher: &mut ReadMatcher,
    ctx: &MatchContext,
    batch: &[ReadRecord],
    errors: &Mutex<Vec<anyhow::Error>>,
) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| matcher.process_batch(ctx, batch)));
    let error = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => anyhow::Error::new(e).context("writing classification output"),
        Err(payload) => {
            // scratch state may be half-updated
            *matcher = ReadMatcher::new();
            anyhow!("worker panicked: {}", panic_message(payload.as_ref()))
        }
    };
    warn!("batch failed: {:#}", error);
    errors
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(error);
}

impl Worker {
    fn new(
        id: usize,
        ctx: Arc<MatchContext>,
        receiver: Receiver<Batch>,
        draining: Arc<AtomicBool>,
        errors: Arc<Mutex<Vec<anyhow::Error>>>,
    ) -> std::io::Result<Worker> {
        let thread = thread::Builder::new()
            .name(format!("matcher-{}", id))
            .spawn(move || {
                let mut matcher = ReadMatcher::new();
                let mut batches = 0usize;
                while let Ok(batch) = receiver.recv() {
                    if draining.load(Ordering::Acquire) {
                        continue;
                    }
                    run_batch(&mut matcher, &ctx, &batch, &errors);
                    batches += 1;
                }
                debug!("matcher-{} done after {} batches", id, batches);
            })?;
        Ok(Worker { id, thread })
    }
}

/// A classification run: a pool of matcher threads fed through a bounded
/// batch queue.
///
/// With zero threads, batches are matched on the submitting thread.
pub struct ClassificationRun {
    ctx: Arc<MatchContext>,
    sender: Option<Sender<Batch>>,
    workers: Vec<Worker>,
    inline: Option<ReadMatcher>,
    draining: Arc<AtomicBool>,
    errors: Arc<Mutex<Vec<anyhow::Error>>>,
}

impl ClassificationRun {
    pub fn start(ctx: MatchContext) -> anyhow::Result<Self> {
        let ctx = Arc::new(ctx);
        let threads = ctx.config.threads;
        let draining = Arc::new(AtomicBool::new(false));
        let errors = Arc::new(Mutex::new(Vec::new()));

        if threads == 0 {
            return Ok(ClassificationRun {
                ctx,
                sender: None,
                workers: Vec::new(),
                inline: Some(ReadMatcher::new()),
                draining,
                errors,
            });
        }

        let (sender, receiver) = bounded(ctx.config.queue_depth);
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let worker = Worker::new(
                id,
                Arc::clone(&ctx),
                receiver.clone(),
                Arc::clone(&draining),
                Arc::clone(&errors),
            )
            .with_context(|| format!("spawning matcher thread {}", id))?;
            workers.push(worker);
        }
        debug!("started {} matcher threads", threads);
        Ok(ClassificationRun {
            ctx,
            sender: Some(sender),
            workers,
            inline: None,
            draining,
            errors,
        })
    }

    pub fn context(&self) -> &MatchContext {
        &self.ctx
    }

    /// Hands a batch to the workers, blocking while the queue is full.
    pub fn submit(&mut self, batch: Vec<ReadRecord>) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if let Some(matcher) = self.inline.as_mut() {
            run_batch(matcher, &self.ctx, &batch, &self.errors);
            return Ok(());
        }
        match &self.sender {
            Some(sender) => sender
                .send(batch)
                .map_err(|_| anyhow!("all matcher threads have exited")),
            None => Err(anyhow!("classification run already closed")),
        }
    }

    /// Lets the workers finish every queued batch, then joins them.
    pub fn finish(self) -> RunReport {
        self.shutdown()
    }

    /// Discards queued batches; in-flight batches still complete.
    pub fn abort(self) -> RunReport {
        self.draining.store(true, Ordering::Release);
        self.shutdown()
    }

    fn shutdown(mut self) -> RunReport {
        // closing the channel wakes every parked worker
        drop(self.sender.take());
        let mut join_errors = Vec::new();
        for worker in self.workers.drain(..) {
            if let Err(payload) = worker.thread.join() {
                join_errors.push(anyhow!(
                    "matcher-{} panicked: {}",
                    worker.id,
                    panic_message(payload.as_ref())
                ));
            }
        }
        if let Err(e) = self.ctx.outputs.flush() {
            join_errors.push(anyhow::Error::new(e).context("flushing classification output"));
        }

        let mut errors = std::mem::take(
            &mut *self
                .errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        errors.extend(join_errors);

        let ctx = match Arc::try_unwrap(self.ctx) {
            Ok(ctx) => ctx,
            Err(shared) => {
                // only reachable if a worker thread outlived its join
                return RunReport {
                    totals: shared.counters.totals(),
                    taxa: Self::taxa_of(&shared),
                    hit_slots: None,
                    errors,
                };
            }
        };
        RunReport {
            totals: ctx.counters.totals(),
            taxa: Self::taxa_of(&ctx),
            hit_slots: ctx.hit_slots,
            errors,
        }
    }

    fn taxa_of(ctx: &MatchContext) -> Vec<TaxonReport> {
        ctx.stats
            .snapshot()
            .into_iter()
            .filter_map(|(index, stats)| {
                ctx.store.value(index).map(|taxid| TaxonReport {
                    taxid: taxid.clone(),
                    stats,
                })
            })
            .collect()
    }
}
