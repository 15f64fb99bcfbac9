//! Batch summary report.
//!
//! Scans whatever output tree a run left behind and writes one row per
//! sample to `summary.tsv`. A missing or unusable artifact never fails the
//! pass: its metrics become `NA` and are listed in `incomplete_metrics`.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::{RunConfig, SampleTable};
use crate::error::PostprocessError;
use crate::workflow::{layout, RunLedger};

use super::manifest::VersionManifest;
use super::metrics;

/// Placeholder for a metric that could not be extracted.
pub const NA: &str = "NA";

/// Minimum genome completeness for a `PASS` QC flag.
pub const COMPLETENESS_PASS: f64 = 0.9;

/// Stage outputs that every alignment-derived metric is computed from.
const ALIGNMENT_UPSTREAM: [(&str, &str); 1] = [("viral_mapping", layout::MAPPED_BAM)];

/// Summary metrics of one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSummary {
    pub sample: String,
    pub kraken2_sars_cov_2_pct: Option<f64>,
    pub mean_depth: Option<f64>,
    pub genome_completeness: Option<f64>,
    pub consensus_n_fraction: Option<f64>,
    pub ivar_variants: Option<usize>,
    /// Only reported when variant calling is enabled
    pub freebayes_variants: Option<usize>,
    pub lineage: Option<String>,
    pub lineage_qc: Option<String>,
    pub incomplete_metrics: Vec<&'static str>,
    /// Upstream stages whose missing outputs invalidate downstream metrics
    pub missing_upstream: Vec<&'static str>,
    /// Stages whose outputs are placeholders left by a failed tool
    pub placeholder_stages: Vec<String>,
}

impl SampleSummary {
    pub fn qc_flag(&self) -> &'static str {
        match self.genome_completeness {
            Some(c) if c >= COMPLETENESS_PASS => "PASS",
            Some(_) => "FAIL",
            None => NA,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete_metrics.is_empty() && self.placeholder_stages.is_empty()
    }

    pub fn status(&self) -> &'static str {
        if self.is_complete() {
            "COMPLETE"
        } else {
            "INCOMPLETE"
        }
    }
}

fn cell<T: Display>(value: &Option<T>) -> String {
    value.as_ref().map_or_else(|| NA.to_string(), T::to_string)
}

fn cell_f64(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| NA.to_string(), |v| format!("{:.*}", precision, v))
}

fn list_cell<T: AsRef<str>>(items: &[T]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(";")
    }
}

/// Output of a postprocessing pass.
#[derive(Debug)]
pub struct PostprocessReport {
    pub summaries: Vec<SampleSummary>,
    pub summary_path: PathBuf,
    pub manifest_path: PathBuf,
}

impl PostprocessReport {
    pub fn incomplete_samples(&self) -> Vec<&str> {
        self.summaries
            .iter()
            .filter(|s| !s.is_complete())
            .map(|s| s.sample.as_str())
            .collect()
    }
}

/// Postprocessing pass over a result directory.
pub struct Aggregator<'a> {
    config: &'a RunConfig,
    samples: &'a SampleTable,
    probe_tools: bool,
}

impl<'a> Aggregator<'a> {
    pub fn new(config: &'a RunConfig, samples: &'a SampleTable) -> Self {
        Self {
            config,
            samples,
            probe_tools: false,
        }
    }

    /// Also records `<tool> --version` for every external tool.
    pub fn with_tool_probing(mut self, probe: bool) -> Self {
        self.probe_tools = probe;
        self
    }

    fn artifact(&self, pattern: &str, sample: &str) -> PathBuf {
        self.config
            .result_dir
            .join(layout::for_sample(pattern, sample))
    }

    /// Collects the metrics of one sample.
    ///
    /// Metrics derived from the alignment are only read while the mapping
    /// output exists; leftovers from an earlier run are not trusted.
    pub fn summarize_sample(&self, sample: &str, ledger: Option<&RunLedger>) -> SampleSummary {
        let mut incomplete = Vec::new();

        let missing_upstream: Vec<&'static str> = ALIGNMENT_UPSTREAM
            .iter()
            .filter(|(_, pattern)| !self.artifact(pattern, sample).exists())
            .map(|(stage, _)| *stage)
            .collect();
        let aligned = missing_upstream.is_empty();

        let kraken2 = metrics::kraken2_sars_cov_2_pct(&self.artifact(layout::KRAKEN2_REPORT, sample));
        if kraken2.is_none() {
            incomplete.push("kraken2_sars_cov_2_pct");
        }

        let depth = aligned
            .then(|| {
                metrics::depth_summary(
                    &self.artifact(layout::DEPTH, sample),
                    self.config.ivar_min_coverage_depth,
                )
            })
            .flatten();
        if depth.is_none() {
            incomplete.extend(["mean_depth", "genome_completeness"]);
        }

        let n_fraction = aligned
            .then(|| metrics::consensus_n_fraction(&self.artifact(layout::CONSENSUS, sample)))
            .flatten();
        if n_fraction.is_none() {
            incomplete.push("consensus_n_fraction");
        }

        let ivar = aligned
            .then(|| metrics::ivar_pass_count(&self.artifact(layout::IVAR_VARIANTS, sample)))
            .flatten();
        if ivar.is_none() {
            incomplete.push("ivar_variants");
        }

        let freebayes = if self.config.run_freebayes {
            let count = aligned
                .then(|| metrics::vcf_record_count(&self.artifact(layout::FREEBAYES_VCF, sample)))
                .flatten();
            if count.is_none() {
                incomplete.push("freebayes_variants");
            }
            count
        } else {
            None
        };

        let lineage = aligned
            .then(|| metrics::lineage_call(&self.artifact(layout::LINEAGE_REPORT, sample)))
            .flatten();
        if lineage.is_none() {
            incomplete.extend(["lineage", "lineage_qc"]);
        }

        let placeholder_stages = ledger
            .map(|l| l.placeholder_stages(sample))
            .unwrap_or_default();

        SampleSummary {
            sample: sample.to_string(),
            kraken2_sars_cov_2_pct: kraken2,
            mean_depth: depth.map(|d| d.mean_depth),
            genome_completeness: depth.map(|d| d.completeness),
            consensus_n_fraction: n_fraction,
            ivar_variants: ivar,
            freebayes_variants: freebayes,
            lineage: lineage.as_ref().map(|l| l.lineage.clone()),
            lineage_qc: lineage.map(|l| l.qc_status),
            incomplete_metrics: incomplete,
            missing_upstream,
            placeholder_stages,
        }
    }

    fn header(&self) -> Vec<&'static str> {
        let mut header = vec![
            "sample",
            "kraken2_sars_cov_2_pct",
            "mean_depth",
            "genome_completeness",
            "consensus_n_fraction",
            "ivar_variants",
        ];
        if self.config.run_freebayes {
            header.push("freebayes_variants");
        }
        header.extend([
            "lineage",
            "lineage_qc",
            "qc_flag",
            "status",
            "incomplete_metrics",
            "missing_upstream",
            "placeholder_stages",
        ]);
        header
    }

    fn row(&self, summary: &SampleSummary) -> Vec<String> {
        let mut row = vec![
            summary.sample.clone(),
            cell_f64(summary.kraken2_sars_cov_2_pct, 2),
            cell_f64(summary.mean_depth, 2),
            cell_f64(summary.genome_completeness, 4),
            cell_f64(summary.consensus_n_fraction, 4),
            cell(&summary.ivar_variants),
        ];
        if self.config.run_freebayes {
            row.push(cell(&summary.freebayes_variants));
        }
        row.extend([
            cell(&summary.lineage),
            cell(&summary.lineage_qc),
            summary.qc_flag().to_string(),
            summary.status().to_string(),
            list_cell(&summary.incomplete_metrics),
            list_cell(&summary.missing_upstream),
            list_cell(&summary.placeholder_stages),
        ]);
        row
    }

    /// Renders the summary table.
    pub fn render(&self, summaries: &[SampleSummary]) -> String {
        let mut out = self.header().join("\t");
        out.push('\n');
        for summary in summaries {
            out.push_str(&self.row(summary).join("\t"));
            out.push('\n');
        }
        out
    }

    /// Writes `summary.tsv` and `versions.json` into the result directory.
    pub fn run(&self) -> Result<PostprocessReport, PostprocessError> {
        let root = &self.config.result_dir;
        fs::create_dir_all(root).map_err(|source| PostprocessError::Write {
            path: root.clone(),
            source,
        })?;

        let ledger = match RunLedger::load(root) {
            Ok(ledger) => Some(ledger),
            Err(e) => {
                warn!("No usable run state ({}); placeholder stages will not be reported", e);
                None
            }
        };

        let summaries: Vec<SampleSummary> = self
            .samples
            .ids()
            .map(|id| self.summarize_sample(id, ledger.as_ref()))
            .collect();

        for summary in summaries.iter().filter(|s| !s.is_complete()) {
            warn!(
                "Sample {} is incomplete (missing: {}; upstream missing: {}; placeholders: {})",
                summary.sample,
                list_cell(&summary.incomplete_metrics),
                list_cell(&summary.missing_upstream),
                list_cell(&summary.placeholder_stages)
            );
        }

        let summary_path = root.join(layout::SUMMARY_REPORT);
        write_file(&summary_path, &self.render(&summaries))?;
        info!(
            "Summary for {} samples written to {}",
            summaries.len(),
            summary_path.display()
        );

        let manifest_path = root.join(layout::VERSION_MANIFEST);
        let mut manifest = VersionManifest::from_config(self.config);
        if self.probe_tools {
            manifest.probe_tools(self.config);
        }
        manifest.write(&manifest_path)?;

        Ok(PostprocessReport {
            summaries,
            summary_path,
            manifest_path,
        })
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), PostprocessError> {
    fs::write(path, content).map_err(|source| PostprocessError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::tests::MINIMAL_CONFIG;
    use crate::config::{ReadPair, Sample};
    use crate::execution::RunResult;
    use crate::workflow::{NodeId, WildcardBinding};
    use tempfile::tempdir;

    fn table(ids: &[&str]) -> SampleTable {
        SampleTable::from_samples(
            ids.iter()
                .map(|id| Sample {
                    id: id.to_string(),
                    pairs: vec![ReadPair {
                        r1: PathBuf::from(format!("/raw/{}_R1.fq", id)),
                        r2: PathBuf::from(format!("/raw/{}_R2.fq", id)),
                    }],
                })
                .collect(),
        )
    }

    fn write_artifact(root: &Path, pattern: &str, sample: &str, content: &str) {
        let path = root.join(layout::for_sample(pattern, sample));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn complete_sample(root: &Path, sample: &str) {
        write_artifact(root, layout::MAPPED_BAM, sample, "BAM");
        write_artifact(
            root,
            layout::KRAKEN2_REPORT,
            sample,
            "95.00\t950\t950\tS\t2697049\tSARS-CoV-2\n",
        );
        write_artifact(root, layout::DEPTH, sample, "MN908947.3\t1\t50\nMN908947.3\t2\t50\n");
        write_artifact(root, layout::CONSENSUS, sample, ">c\nACGT\n");
        write_artifact(
            root,
            layout::IVAR_VARIANTS,
            sample,
            "REGION\tPOS\tPASS\nMN908947.3\t241\tTRUE\n",
        );
        write_artifact(
            root,
            layout::LINEAGE_REPORT,
            sample,
            "taxon,lineage,qc_status\nc,BA.2,pass\n",
        );
    }

    fn config(dir: &Path) -> RunConfig {
        RunConfig::from_yaml_str(MINIMAL_CONFIG, dir).unwrap()
    }

    #[test]
    fn test_complete_sample_summary() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        complete_sample(&config.result_dir, "S1");
        let samples = table(&["S1"]);

        let summary = Aggregator::new(&config, &samples).summarize_sample("S1", None);

        assert_eq!(summary.kraken2_sars_cov_2_pct, Some(95.0));
        assert_eq!(summary.mean_depth, Some(50.0));
        assert_eq!(summary.genome_completeness, Some(1.0));
        assert_eq!(summary.ivar_variants, Some(1));
        assert_eq!(summary.lineage.as_deref(), Some("BA.2"));
        assert_eq!(summary.qc_flag(), "PASS");
        assert_eq!(summary.status(), "COMPLETE");
    }

    #[test]
    fn test_missing_mapping_output_yields_placeholders_for_that_sample() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let root = config.result_dir.clone();
        complete_sample(&root, "S1");
        complete_sample(&root, "S2");
        // derived files from the earlier run are still on disk
        fs::remove_file(root.join(layout::for_sample(layout::MAPPED_BAM, "S2"))).unwrap();

        let samples = table(&["S1", "S2"]);
        let report = Aggregator::new(&config, &samples).run().unwrap();

        assert_eq!(report.incomplete_samples(), vec!["S2"]);
        let tsv = fs::read_to_string(&report.summary_path).unwrap();
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("sample\tkraken2_sars_cov_2_pct\tmean_depth"));
        assert!(!lines[0].contains("freebayes_variants"));
        assert_eq!(
            lines[1],
            "S1\t95.00\t50.00\t1.0000\t0.0000\t1\tBA.2\tpass\tPASS\tCOMPLETE\tnone\tnone\tnone"
        );
        assert!(lines[2].starts_with("S2\t95.00\tNA\tNA\tNA\tNA\tNA\tNA\tNA\tINCOMPLETE\t"));
        assert!(lines[2].ends_with("\tviral_mapping\tnone"));

        let s2 = &report.summaries[1];
        assert_eq!(s2.missing_upstream, vec!["viral_mapping"]);
        assert_eq!(
            s2.incomplete_metrics,
            vec![
                "mean_depth",
                "genome_completeness",
                "consensus_n_fraction",
                "ivar_variants",
                "lineage",
                "lineage_qc"
            ]
        );
        assert!(report.manifest_path.exists());
    }

    #[test]
    fn test_empty_result_dir_still_reports() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let samples = table(&["S1"]);

        let report = Aggregator::new(&config, &samples).run().unwrap();

        let summary = &report.summaries[0];
        assert_eq!(summary.qc_flag(), NA);
        assert_eq!(summary.incomplete_metrics.len(), 7);
    }

    #[test]
    fn test_low_completeness_fails_qc() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        complete_sample(&config.result_dir, "S1");
        write_artifact(
            &config.result_dir,
            layout::DEPTH,
            "S1",
            "MN908947.3\t1\t50\nMN908947.3\t2\t0\n",
        );
        let samples = table(&["S1"]);

        let summary = Aggregator::new(&config, &samples).summarize_sample("S1", None);
        assert_eq!(summary.genome_completeness, Some(0.5));
        assert_eq!(summary.qc_flag(), "FAIL");
    }

    #[test]
    fn test_placeholder_stages_from_ledger() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let root = config.result_dir.clone();
        complete_sample(&root, "S1");
        write_artifact(&root, layout::LINEAGE_REPORT, "S1", "");

        let mut ledger = RunLedger::new("results");
        ledger.record(
            &NodeId::new("lineage", WildcardBinding::for_sample("S1")),
            RunResult::FailureWithPlaceholder { exit_code: Some(1) },
        );
        ledger.save(&root).unwrap();

        let samples = table(&["S1"]);
        let report = Aggregator::new(&config, &samples).run().unwrap();
        let summary = &report.summaries[0];

        assert_eq!(summary.placeholder_stages, vec!["lineage"]);
        assert_eq!(summary.incomplete_metrics, vec!["lineage", "lineage_qc"]);
        assert_eq!(summary.status(), "INCOMPLETE");
    }

    #[test]
    fn test_freebayes_column_when_enabled() {
        let dir = tempdir().unwrap();
        let yaml = MINIMAL_CONFIG.replace("run_freebayes: false", "run_freebayes: true");
        let config = RunConfig::from_yaml_str(&yaml, dir.path()).unwrap();
        complete_sample(&config.result_dir, "S1");
        write_artifact(
            &config.result_dir,
            layout::FREEBAYES_VCF,
            "S1",
            "##fileformat=VCFv4.2\n#CHROM\nMN908947.3\t241\n",
        );
        let samples = table(&["S1"]);

        let aggregator = Aggregator::new(&config, &samples);
        let summary = aggregator.summarize_sample("S1", None);
        assert_eq!(summary.freebayes_variants, Some(1));
        assert!(aggregator.render(&[summary]).contains("\tfreebayes_variants\t"));
    }
}
