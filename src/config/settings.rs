//! Run Configuration
//!
//! Loads the YAML run configuration, checks the required keys and
//! resolves every path relative to the configuration file.
//!
//! # Example YAML Format
//!
//! ```yaml
//! samples: sample_table.csv
//! result_dir: results
//! min_len: 20
//! min_qual: 20
//! scheme_bed: resources/primer_schemes/artic_v3/nCoV-2019.bed
//! viral_reference_genome: resources/MN908947.3.fasta
//! viral_reference_feature_coords: resources/MN908947.3.gff3
//! kraken2_db: data/Kraken2/db
//! composite_reference: data/composite_human_viral_reference.fna
//! run_breseq: false
//! breseq_reference: resources/MN908947.3.gbk
//! run_freebayes: true
//! pangolin_version: "4.3"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::ConfigError;

/// Keys that must be present (and non-null) in every configuration.
pub const REQUIRED_KEYS: &[&str] = &[
    "samples",
    "result_dir",
    "min_len",
    "min_qual",
    "scheme_bed",
    "viral_reference_genome",
    "viral_reference_feature_coords",
    "kraken2_db",
    "composite_reference",
    "run_breseq",
    "run_freebayes",
];

/// Validated run configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Sample table listing one row per (sample, lane)
    pub samples: PathBuf,

    /// Root of the output tree
    pub result_dir: PathBuf,

    /// Minimum read length kept after trimming
    pub min_len: u32,

    /// Minimum base quality used for trimming and primer clipping
    pub min_qual: u32,

    /// Primer scheme BED file
    pub scheme_bed: PathBuf,

    pub viral_reference_genome: PathBuf,

    pub viral_reference_feature_coords: PathBuf,

    /// Kraken2 database directory
    pub kraken2_db: PathBuf,

    /// Combined host + viral reference used to remove host reads
    pub composite_reference: PathBuf,

    /// Enables the breseq mutation analysis module
    pub run_breseq: bool,

    /// Checked only when `run_breseq` is set
    #[serde(default)]
    pub breseq_reference: Option<PathBuf>,

    /// Enables the FreeBayes variant calling module
    pub run_freebayes: bool,

    #[serde(default = "default_mpileup_depth")]
    pub mpileup_depth: u32,

    #[serde(default = "default_min_coverage_depth")]
    pub ivar_min_coverage_depth: u32,

    #[serde(default = "default_min_freq_threshold")]
    pub ivar_min_freq_threshold: f64,

    #[serde(default = "default_min_variant_quality")]
    pub ivar_min_variant_quality: u32,

    /// Minimum allele frequency to call a consensus base
    #[serde(default = "default_consensus_freq_threshold")]
    pub ivar_freq_threshold: f64,

    #[serde(default)]
    pub pangolin_version: Option<String>,

    #[serde(default)]
    pub pangolin_data_version: Option<String>,

    #[serde(default)]
    pub scorpio_version: Option<String>,

    #[serde(default)]
    pub constellations_version: Option<String>,

    #[serde(default)]
    pub nextclade_version: Option<String>,

    #[serde(default)]
    pub nextclade_data_version: Option<String>,

    /// Sample id prefixes identifying negative controls
    #[serde(default)]
    pub negative_control_prefix: Vec<String>,

    #[serde(default)]
    pub phylo_include_seqs: bool,

    /// Checkout of the ncov-tools QC suite, needed by the `ncov_tools` target
    #[serde(default)]
    pub ncov_tools_dir: Option<PathBuf>,
}

fn default_mpileup_depth() -> u32 {
    100_000
}

fn default_min_coverage_depth() -> u32 {
    10
}

fn default_min_freq_threshold() -> f64 {
    0.03
}

fn default_min_variant_quality() -> u32 {
    20
}

fn default_consensus_freq_threshold() -> f64 {
    0.75
}

impl RunConfig {
    /// Loads and validates a configuration file.
    ///
    /// Relative paths inside the document are resolved against the
    /// directory containing `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::from_yaml_str(&content, &base_dir).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parses a configuration document, resolving paths against `base_dir`.
    pub fn from_yaml_str(content: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;

        check_required_keys(&value)?;

        let mut config: RunConfig =
            serde_yaml::from_value(value).map_err(|e| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                message: e.to_string(),
            })?;

        config.resolve_paths(base_dir);
        config.validate()?;

        debug!("Configuration resolved: {:?}", config);
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base_dir.join(&*p);
            }
        };

        resolve(&mut self.samples);
        resolve(&mut self.result_dir);
        resolve(&mut self.scheme_bed);
        resolve(&mut self.viral_reference_genome);
        resolve(&mut self.viral_reference_feature_coords);
        resolve(&mut self.kraken2_db);
        resolve(&mut self.composite_reference);
        if let Some(p) = self.breseq_reference.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.ncov_tools_dir.as_mut() {
            resolve(p);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_len == 0 {
            return Err(ConfigError::InvalidValue {
                key: "min_len".into(),
                reason: "must be greater than zero".into(),
            });
        }

        for (key, value) in [
            ("ivar_min_freq_threshold", self.ivar_min_freq_threshold),
            ("ivar_freq_threshold", self.ivar_freq_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    reason: format!("{} is not within [0, 1]", value),
                });
            }
        }

        if self.negative_control_prefix.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: "negative_control_prefix".into(),
                reason: "prefixes must not be empty".into(),
            });
        }

        Ok(())
    }

    /// Name of the run, taken from the output directory name.
    pub fn run_name(&self) -> String {
        self.result_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("default")
            .to_string()
    }
}

/// Collects every required key that is absent or null.
fn check_required_keys(value: &Value) -> Result<(), ConfigError> {
    let Value::Mapping(map) = value else {
        return Err(ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: "top-level document must be a mapping".into(),
        });
    };

    let missing: Vec<String> = REQUIRED_KEYS
        .iter()
        .filter(|key| matches!(map.get(**key), None | Some(Value::Null)))
        .map(|key| key.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingKeys(missing))
    }
}
