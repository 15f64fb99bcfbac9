//! Metric extraction from stage artifacts.
//!
//! Every extractor returns `None` when the artifact is absent, empty or
//! cannot be parsed; the aggregator turns that into a placeholder.

use std::fs;
use std::path::Path;

use log::debug;

/// NCBI taxonomy id of SARS-CoV-2.
pub const SARS_COV_2_TAXID: &str = "2697049";

fn read_nonempty(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => Some(content),
        Ok(_) => {
            debug!("{} is empty", path.display());
            None
        }
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

/// Percentage of reads assigned to SARS-CoV-2 in a kraken2 report.
pub fn kraken2_sars_cov_2_pct(path: &Path) -> Option<f64> {
    let content = read_nonempty(path)?;
    content.lines().find_map(|line| {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() >= 6 && fields[4].trim() == SARS_COV_2_TAXID {
            fields[0].trim().parse().ok()
        } else {
            None
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthSummary {
    pub mean_depth: f64,
    /// Fraction of positions at or above the minimum depth
    pub completeness: f64,
}

/// Summarizes a `samtools depth -a` table (chrom, pos, depth).
pub fn depth_summary(path: &Path, min_depth: u32) -> Option<DepthSummary> {
    let content = read_nonempty(path)?;

    let mut positions = 0u64;
    let mut covered = 0u64;
    let mut total = 0u64;

    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let depth: u64 = line.split('\t').nth(2)?.trim().parse().ok()?;
        positions += 1;
        total += depth;
        if depth >= u64::from(min_depth) {
            covered += 1;
        }
    }

    if positions == 0 {
        return None;
    }
    Some(DepthSummary {
        mean_depth: total as f64 / positions as f64,
        completeness: covered as f64 / positions as f64,
    })
}

/// Fraction of ambiguous (`N`) bases in a consensus FASTA.
pub fn consensus_n_fraction(path: &Path) -> Option<f64> {
    let content = read_nonempty(path)?;

    let mut bases = 0usize;
    let mut ambiguous = 0usize;
    for line in content.lines().filter(|l| !l.starts_with('>')) {
        for base in line.trim().chars() {
            bases += 1;
            if base.eq_ignore_ascii_case(&'n') {
                ambiguous += 1;
            }
        }
    }

    if bases == 0 {
        None
    } else {
        Some(ambiguous as f64 / bases as f64)
    }
}

/// Variants passing iVar's significance filter (`PASS` column is TRUE).
pub fn ivar_pass_count(path: &Path) -> Option<usize> {
    let content = read_nonempty(path)?;
    let mut lines = content.lines();
    let pass_col = lines.next()?.split('\t').position(|c| c.trim() == "PASS")?;

    Some(
        lines
            .filter(|l| {
                l.split('\t')
                    .nth(pass_col)
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
            })
            .count(),
    )
}

/// Number of data lines in a VCF.
pub fn vcf_record_count(path: &Path) -> Option<usize> {
    let content = read_nonempty(path)?;
    if !content.starts_with("##fileformat=VCF") {
        debug!("{} is not a VCF", path.display());
        return None;
    }
    Some(
        content
            .lines()
            .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
            .count(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageCall {
    pub lineage: String,
    pub qc_status: String,
}

/// First call of a pangolin lineage report.
pub fn lineage_call(path: &Path) -> Option<LineageCall> {
    let content = read_nonempty(path)?;
    let mut lines = content.lines();
    let header: Vec<&str> = lines.next()?.split(',').map(str::trim).collect();
    let lineage_col = header.iter().position(|c| *c == "lineage")?;
    let qc_col = header.iter().position(|c| *c == "qc_status")?;

    let row: Vec<&str> = lines.next()?.split(',').map(str::trim).collect();
    let lineage = row.get(lineage_col).filter(|v| !v.is_empty())?;
    let qc_status = row.get(qc_col).copied().unwrap_or("");

    Some(LineageCall {
        lineage: lineage.to_string(),
        qc_status: qc_status.to_string(),
    })
}
