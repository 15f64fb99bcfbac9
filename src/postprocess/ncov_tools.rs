//! ncov-tools QC suite preparation.
//!
//! Stages a run's alignments, variants and consensus sequences into the
//! ncov-tools data directory, writes its `config.yaml` and launches
//! `run_ncov_tools.sh`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;

use crate::config::{RunConfig, SampleTable};
use crate::error::PostprocessError;
use crate::execution::{execute_node, RunResult};
use crate::workflow::template::shell_quote;
use crate::workflow::{layout, FailurePolicy, Node, NodeId, ResolvedAction, WildcardBinding};

/// Pangolin major versions ncov-tools supports directly.
const SUPPORTED_PANGOLIN: [&str; 2] = ["3", "4"];
const DEFAULT_PANGOLIN: &str = "4";

const RUN_SCRIPT: &str = "run_ncov_tools.sh";

/// Which variant caller's outputs are staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantSource {
    FreeBayes,
    Ivar,
}

impl VariantSource {
    fn variants_pattern(self) -> &'static str {
        match self {
            VariantSource::FreeBayes => layout::FREEBAYES_VCF,
            VariantSource::Ivar => layout::IVAR_VARIANTS,
        }
    }

    fn consensus_pattern(self) -> &'static str {
        match self {
            VariantSource::FreeBayes => layout::FREEBAYES_CONSENSUS,
            VariantSource::Ivar => layout::CONSENSUS,
        }
    }

    /// Extension of the staged variants file.
    fn variants_suffix(self) -> &'static str {
        match self {
            VariantSource::FreeBayes => "variants.vcf",
            VariantSource::Ivar => "variants.tsv",
        }
    }
}

/// Pangolin major version from a version tag such as `v4.3.1`.
///
/// Anything other than 3 or 4 falls back to 4.
pub fn pangolin_major_version(version: Option<&str>) -> &'static str {
    let major = version
        .map(|v| v.trim().trim_start_matches(['v', 'V']))
        .and_then(|v| v.split('.').next())
        .unwrap_or("");

    match SUPPORTED_PANGOLIN.iter().find(|s| **s == major) {
        Some(supported) => *supported,
        None => {
            warn!(
                "Pangolin version {:?} is not supported by ncov-tools; using {}",
                version, DEFAULT_PANGOLIN
            );
            DEFAULT_PANGOLIN
        }
    }
}

/// Sample ids starting with any of the negative control prefixes.
pub fn negative_controls(samples: &SampleTable, prefixes: &[String]) -> Vec<String> {
    samples
        .ids()
        .filter(|id| prefixes.iter().any(|p| id.starts_with(p.as_str())))
        .map(str::to_string)
        .collect()
}

/// `config.yaml` consumed by ncov-tools.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NcovToolsConfig {
    pub data_root: PathBuf,
    pub run_name: String,
    pub amplicon_bed: PathBuf,
    pub reference_genome: PathBuf,
    pub platform: String,
    pub primer_bed: PathBuf,
    pub bed_type: String,
    pub offset: u32,
    pub completeness_threshold: f64,
    pub bam_pattern: String,
    pub primer_trimmed_bam_pattern: String,
    pub consensus_pattern: String,
    pub variants_pattern: String,
    pub assign_lineages: bool,
    pub tree_include_consensus: bool,
    pub negative_control_samples: Vec<String>,
    pub mutation_set: String,
    pub output_directory: String,
    pub pangolin_version: String,
}

/// Files staged for ncov-tools.
#[derive(Debug)]
pub struct NcovToolsStaging {
    pub data_root: PathBuf,
    pub config_path: PathBuf,
    pub variant_source: VariantSource,
    pub linked: usize,
    pub skipped: Vec<PathBuf>,
}

/// Replaces `dest` with a hard link to `source`, copying across filesystems.
fn link_or_copy(source: &Path, dest: &Path) -> io::Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    if fs::hard_link(source, dest).is_err() {
        fs::copy(source, dest)?;
    }
    Ok(())
}

/// Writes `source` to `dest` with every FASTA header replaced by `>sample`.
///
/// `dest` is written as a new file so a linked source is left untouched.
fn stage_consensus(source: &Path, dest: &Path, sample: &str) -> io::Result<()> {
    let content = fs::read_to_string(source)?;
    let mut renamed = String::with_capacity(content.len());
    for line in content.lines() {
        if line.starts_with('>') {
            renamed.push('>');
            renamed.push_str(sample);
        } else {
            renamed.push_str(line);
        }
        renamed.push('\n');
    }

    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    fs::write(dest, renamed)
}

pub struct NcovToolsSetup<'a> {
    config: &'a RunConfig,
    samples: &'a SampleTable,
    cores: usize,
}

impl<'a> NcovToolsSetup<'a> {
    pub fn new(config: &'a RunConfig, samples: &'a SampleTable, cores: usize) -> Self {
        Self {
            config,
            samples,
            cores: cores.max(1),
        }
    }

    fn tools_dir(&self) -> Result<&'a Path, PostprocessError> {
        self.config
            .ncov_tools_dir
            .as_deref()
            .ok_or(PostprocessError::NotConfigured("ncov_tools_dir"))
    }

    fn artifact(&self, pattern: &str, sample: &str) -> PathBuf {
        self.config
            .result_dir
            .join(layout::for_sample(pattern, sample))
    }

    /// FreeBayes outputs only when enabled and present for every sample.
    pub fn variant_source(&self) -> VariantSource {
        if !self.config.run_freebayes {
            return VariantSource::Ivar;
        }

        let source = VariantSource::FreeBayes;
        let missing = self.samples.ids().find(|id| {
            !self.artifact(source.variants_pattern(), id).exists()
                || !self.artifact(source.consensus_pattern(), id).exists()
        });

        match missing {
            Some(id) => {
                warn!("FreeBayes outputs missing for {}; staging iVar outputs instead", id);
                VariantSource::Ivar
            }
            None => source,
        }
    }

    fn tools_config(&self, data_root: &Path, source: VariantSource) -> NcovToolsConfig {
        let run_name = self.config.run_name();
        let data = data_root.display();

        NcovToolsConfig {
            data_root: data_root.to_path_buf(),
            run_name: run_name.clone(),
            amplicon_bed: self.config.scheme_bed.clone(),
            reference_genome: self.config.viral_reference_genome.clone(),
            platform: "illumina".into(),
            primer_bed: self.config.scheme_bed.clone(),
            bed_type: "unique_amplicons".into(),
            offset: 0,
            completeness_threshold: 0.9,
            bam_pattern: format!("{}/{{sample}}.bam", data),
            primer_trimmed_bam_pattern: format!("{}/{{sample}}.mapped.primertrimmed.sorted.bam", data),
            consensus_pattern: format!("{}/{{sample}}.consensus.fasta", data),
            variants_pattern: format!("{}/{{sample}}.{}", data, source.variants_suffix()),
            assign_lineages: true,
            tree_include_consensus: self.config.phylo_include_seqs,
            negative_control_samples: negative_controls(
                self.samples,
                &self.config.negative_control_prefix,
            ),
            mutation_set: "spike_mutations".into(),
            output_directory: format!("{}_ncovresults", run_name),
            pangolin_version: pangolin_major_version(self.config.pangolin_version.as_deref())
                .to_string(),
        }
    }

    /// Recreates the data directory, stages every sample and writes
    /// `config.yaml`.
    pub fn prepare(&self) -> Result<NcovToolsStaging, PostprocessError> {
        let tools_dir = self.tools_dir()?;
        let data_root = tools_dir.join(self.config.run_name());
        let write_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| PostprocessError::Write { path, source }
        };

        if data_root.exists() {
            fs::remove_dir_all(&data_root).map_err(write_error(&data_root))?;
        }
        fs::create_dir_all(&data_root).map_err(write_error(&data_root))?;

        let source = self.variant_source();
        let mut linked = 0;
        let mut skipped = Vec::new();

        for sample in self.samples.ids() {
            let files = [
                (layout::MAPPED_BAM, format!("{}.bam", sample)),
                (
                    layout::PRIMER_TRIMMED_BAM,
                    format!("{}.mapped.primertrimmed.sorted.bam", sample),
                ),
                (source.variants_pattern(), format!("{}.{}", sample, source.variants_suffix())),
            ];

            for (pattern, name) in files {
                let from = self.artifact(pattern, sample);
                if !from.exists() {
                    warn!("Skipping missing {}", from.display());
                    skipped.push(from);
                    continue;
                }
                let dest = data_root.join(name);
                link_or_copy(&from, &dest).map_err(write_error(&dest))?;
                linked += 1;
            }

            let consensus = self.artifact(source.consensus_pattern(), sample);
            if consensus.exists() {
                let dest = data_root.join(format!("{}.consensus.fasta", sample));
                stage_consensus(&consensus, &dest, sample).map_err(write_error(&dest))?;
                linked += 1;
            } else {
                warn!("Skipping missing {}", consensus.display());
                skipped.push(consensus);
            }
        }

        let tools_config = self.tools_config(&data_root, source);
        if !tools_config.negative_control_samples.is_empty() {
            info!(
                "Negative control samples: {}",
                tools_config.negative_control_samples.join(", ")
            );
        }

        let config_path = tools_dir.join("config.yaml");
        let yaml = serde_yaml::to_string(&tools_config).map_err(|e| PostprocessError::Serialize {
            path: config_path.clone(),
            message: e.to_string(),
        })?;
        fs::write(&config_path, yaml).map_err(write_error(&config_path))?;

        info!(
            "Staged {} files for ncov-tools in {} ({} skipped)",
            linked,
            data_root.display(),
            skipped.len()
        );

        Ok(NcovToolsStaging {
            data_root,
            config_path,
            variant_source: source,
            linked,
            skipped,
        })
    }

    /// Prepares the data directory and runs the ncov-tools launcher.
    ///
    /// Returns `None` when the launcher script is absent.
    pub fn run(&self) -> Result<Option<RunResult>, PostprocessError> {
        self.prepare()?;
        let tools_dir = self.tools_dir()?;
        let script = tools_dir.join(RUN_SCRIPT);

        if !script.exists() {
            warn!("{} not found; ncov-tools was prepared but not run", script.display());
            return Ok(None);
        }

        info!("Running ncov-tools using {} cores", self.cores);
        let node = Node {
            id: NodeId::new("ncov_tools", WildcardBinding::new()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            log: Some(PathBuf::from("logs/ncov_tools.log")),
            benchmark: None,
            threads: self.cores,
            action: ResolvedAction::Shell {
                tool: "ncov-tools".into(),
                command: format!(
                    "cd {} && bash {} -c {} -s {}",
                    shell_quote(&tools_dir.to_string_lossy()),
                    shell_quote(&script.to_string_lossy()),
                    self.cores,
                    shell_quote(&self.config.run_name())
                ),
            },
            on_failure: FailurePolicy::Strict,
        };

        Ok(Some(execute_node(&node, &self.config.result_dir)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::tests::MINIMAL_CONFIG;
    use crate::config::{ReadPair, Sample};
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

    fn config(dir: &Path, extra: &str) -> RunConfig {
        let yaml = format!("{}ncov_tools_dir: ncov-tools\n{}", MINIMAL_CONFIG, extra);
        RunConfig::from_yaml_str(&yaml, dir).unwrap()
    }

    fn write_artifact(config: &RunConfig, pattern: &str, sample: &str, content: &str) {
        let path = config.result_dir.join(layout::for_sample(pattern, sample));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn ivar_outputs(config: &RunConfig, sample: &str) {
        write_artifact(config, layout::MAPPED_BAM, sample, "bam");
        write_artifact(config, layout::PRIMER_TRIMMED_BAM, sample, "trimmed");
        write_artifact(config, layout::IVAR_VARIANTS, sample, "REGION\tPASS\n");
        write_artifact(
            config,
            layout::CONSENSUS,
            sample,
            &format!(">Consensus_{}.primertrimmed threshold_0.75\nACGT\n", sample),
        );
    }

    #[test]
    fn test_pangolin_major_version() {
        assert_eq!(pangolin_major_version(Some("v3.1.20")), "3");
        assert_eq!(pangolin_major_version(Some("4.3")), "4");
        assert_eq!(pangolin_major_version(Some("5.0")), "4");
        assert_eq!(pangolin_major_version(Some("latest")), "4");
        assert_eq!(pangolin_major_version(None), "4");
    }

    #[test]
    fn test_negative_controls() {
        let samples = table(&["S1", "NEG-1", "Blank2", "S2"]);
        let prefixes = vec!["NEG".to_string(), "Blank".to_string()];
        assert_eq!(negative_controls(&samples, &prefixes), vec!["NEG-1", "Blank2"]);
        assert!(negative_controls(&samples, &[]).is_empty());
    }

    #[test]
    fn test_requires_tools_dir() {
        let dir = tempdir().unwrap();
        let config = RunConfig::from_yaml_str(MINIMAL_CONFIG, dir.path()).unwrap();
        let samples = table(&["S1"]);

        let err = NcovToolsSetup::new(&config, &samples, 2).prepare().unwrap_err();
        assert!(matches!(err, PostprocessError::NotConfigured("ncov_tools_dir")));
    }

    #[test]
    fn test_prepare_stages_ivar_outputs() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), "negative_control_prefix: [NEG]\n");
        ivar_outputs(&config, "S1");
        ivar_outputs(&config, "NEG1");
        let samples = table(&["S1", "NEG1"]);

        let staging = NcovToolsSetup::new(&config, &samples, 2).prepare().unwrap();

        assert_eq!(staging.variant_source, VariantSource::Ivar);
        assert_eq!(staging.linked, 8);
        assert!(staging.skipped.is_empty());
        assert_eq!(staging.data_root, dir.path().join("ncov-tools/results"));
        assert!(staging.data_root.join("S1.bam").exists());
        assert!(staging.data_root.join("S1.variants.tsv").exists());
        assert_eq!(
            fs::read_to_string(staging.data_root.join("S1.consensus.fasta")).unwrap(),
            ">S1\nACGT\n"
        );
        // the pipeline's own consensus keeps its header
        assert!(fs::read_to_string(config.result_dir.join("S1/09_consensus/S1.consensus.fa"))
            .unwrap()
            .starts_with(">Consensus_S1"));

        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(&staging.config_path).unwrap()).unwrap();
        assert_eq!(yaml["run_name"], "results");
        assert_eq!(yaml["pangolin_version"], "4");
        assert_eq!(yaml["negative_control_samples"][0], "NEG1");
        assert!(yaml["variants_pattern"]
            .as_str()
            .unwrap()
            .ends_with("{sample}.variants.tsv"));
    }

    #[test]
    fn test_freebayes_falls_back_to_ivar_when_incomplete() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), "");
        config.run_freebayes = true;
        ivar_outputs(&config, "S1");
        ivar_outputs(&config, "S2");
        write_artifact(&config, layout::FREEBAYES_VCF, "S1", "##fileformat=VCFv4.2\n");
        write_artifact(&config, layout::FREEBAYES_CONSENSUS, "S1", ">fb\nACGT\n");
        let samples = table(&["S1", "S2"]);

        let setup = NcovToolsSetup::new(&config, &samples, 1);
        assert_eq!(setup.variant_source(), VariantSource::Ivar);

        write_artifact(&config, layout::FREEBAYES_VCF, "S2", "##fileformat=VCFv4.2\n");
        write_artifact(&config, layout::FREEBAYES_CONSENSUS, "S2", ">fb\nACGT\n");
        assert_eq!(setup.variant_source(), VariantSource::FreeBayes);

        let staging = setup.prepare().unwrap();
        assert!(staging.data_root.join("S2.variants.vcf").exists());
        assert!(!staging.data_root.join("S2.variants.tsv").exists());
    }

    #[test]
    fn test_missing_artifacts_skipped() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), "");
        ivar_outputs(&config, "S1");
        let samples = table(&["S1", "S2"]);

        let staging = NcovToolsSetup::new(&config, &samples, 1).prepare().unwrap();
        assert_eq!(staging.linked, 4);
        assert_eq!(staging.skipped.len(), 4);
    }

    #[test]
    fn test_prepare_recreates_data_root() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), "");
        let stale = dir.path().join("ncov-tools/results/old.bam");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, "old").unwrap();
        let samples = table(&["S1"]);

        NcovToolsSetup::new(&config, &samples, 1).prepare().unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_run_without_script_only_prepares() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), "");
        ivar_outputs(&config, "S1");
        let samples = table(&["S1"]);

        let result = NcovToolsSetup::new(&config, &samples, 1).run().unwrap();
        assert!(result.is_none());
        assert!(dir.path().join("ncov-tools/config.yaml").exists());
    }

    #[test]
    fn test_run_invokes_launcher() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), "");
        ivar_outputs(&config, "S1");
        fs::create_dir_all(dir.path().join("ncov-tools")).unwrap();
        fs::write(
            dir.path().join("ncov-tools/run_ncov_tools.sh"),
            "echo \"$@\" > launched.txt\n",
        )
        .unwrap();
        let samples = table(&["S1"]);

        let result = NcovToolsSetup::new(&config, &samples, 3).run().unwrap();
        assert_eq!(result, Some(RunResult::Success));
        assert_eq!(
            fs::read_to_string(dir.path().join("ncov-tools/launched.txt")).unwrap(),
            "-c 3 -s results\n"
        );
    }
}
