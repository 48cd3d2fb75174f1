use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::builder::BuildSummary;
use crate::matcher::RunTotals;
use crate::threadpool::RunReport;

pub const REPORT_HEADER: &str =
    "taxid\tpercent_reads\treads\tkmers\tunique_kmers\tcontigs\tmax_contig_len\tmax_contig_read";

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

/// One TSV line per taxon seen in the run, most reads first, after a line
/// for unclassified reads.
pub fn write_taxon_report<W: Write>(out: &mut W, report: &RunReport) -> io::Result<()> {
    let totals = &report.totals;
    writeln!(out, "{}", REPORT_HEADER)?;
    writeln!(
        out,
        "0\t{:.2}\t{}\t0\t0\t0\t0\t",
        percent(totals.unclassified, totals.reads),
        totals.unclassified
    )?;

    let mut taxa: Vec<_> = report.taxa.iter().collect();
    taxa.sort_by(|a, b| b.stats.reads.cmp(&a.stats.reads).then(a.taxid.cmp(&b.taxid)));
    for taxon in taxa {
        let stats = &taxon.stats;
        let descriptor = stats
            .max_contig_descriptor
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        writeln!(
            out,
            "{}\t{:.2}\t{}\t{}\t{}\t{}\t{}\t{}",
            taxon.taxid,
            percent(stats.reads, totals.reads),
            stats.reads,
            stats.kmers,
            stats.unique_kmers,
            stats.contigs,
            stats.max_contig_len,
            descriptor
        )?;
    }
    Ok(())
}

pub fn report_taxa<P: AsRef<Path>>(path: P, report: &RunReport) -> Result<()> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("Error creating {}", path.display()))?;
    let mut ofs = BufWriter::new(file);
    write_taxon_report(&mut ofs, report)?;
    ofs.flush()?;
    Ok(())
}

pub fn report_stats(duration_secs: f64, totals: &RunTotals) {
    if atty::is(atty::Stream::Stderr) {
        eprint!("\r");
    }
    let minutes = (duration_secs / 60.0).max(f64::EPSILON);

    eprintln!(
        "{} sequences ({:.2} Mbp) processed in {:.3}s ({:.1} Kseq/m, {:.2} Mbp/m).",
        totals.reads,
        totals.bases as f64 / 1.0e6,
        duration_secs,
        totals.reads as f64 / 1.0e3 / minutes,
        totals.bases as f64 / 1.0e6 / minutes
    );
    eprintln!(
        "  {} sequences classified ({:.2}%)",
        totals.classified,
        percent(totals.classified, totals.reads)
    );
    eprintln!(
        "  {} sequences unclassified ({:.2}%)",
        totals.unclassified,
        percent(totals.unclassified, totals.reads)
    );
    if totals.skipped_reads > 0 {
        eprintln!("  {} sequences skipped as too long", totals.skipped_reads);
    }
    if totals.filtered_reads > 0 {
        eprintln!("  {} sequences rejected by the pre-filter", totals.filtered_reads);
    }
    if totals.invalid_windows > 0 {
        eprintln!("  {} k-mer windows with invalid bases", totals.invalid_windows);
    }
}

pub fn report_build(summary: &BuildSummary) {
    eprintln!(
        "{} references ({} unmapped), {} k-mer windows",
        summary.references, summary.unmapped_references, summary.windows
    );
    eprintln!(
        "  {} distinct k-mers stored, {} duplicates, {} promoted to a common ancestor",
        summary.inserted, summary.duplicates, summary.promoted
    );
}
