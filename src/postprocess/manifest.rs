//! Version manifest (`versions.json`).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Local};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::PostprocessError;
use crate::workflow::StageRegistry;

/// Recorded for a version the configuration does not pin.
pub const UNPINNED: &str = "unpinned";

/// Recorded when a tool cannot report its version.
pub const UNKNOWN: &str = "NA";

/// Pinned classification tool and database versions of a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VersionManifest {
    pub ampliflow_version: String,
    pub generated_at: DateTime<Local>,
    pub pangolin: String,
    pub pangolin_data: String,
    pub scorpio: String,
    pub constellations: String,
    pub nextclade: String,
    pub nextclade_dataset: String,
    pub kraken2_db: PathBuf,

    /// `<tool> --version` output, when probing was requested
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, String>,
}

fn pinned(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| UNPINNED.to_string())
}

impl VersionManifest {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            ampliflow_version: crate::VERSION.to_string(),
            generated_at: Local::now(),
            pangolin: pinned(&config.pangolin_version),
            pangolin_data: pinned(&config.pangolin_data_version),
            scorpio: pinned(&config.scorpio_version),
            constellations: pinned(&config.constellations_version),
            nextclade: pinned(&config.nextclade_version),
            nextclade_dataset: pinned(&config.nextclade_data_version),
            kraken2_db: config.kraken2_db.clone(),
            tools: BTreeMap::new(),
        }
    }

    /// Records the reported version of every external tool the stage
    /// registry invokes.
    pub fn probe_tools(&mut self, config: &RunConfig) {
        let registry = StageRegistry::standard(config);
        let tools: BTreeSet<&str> = registry.templates().iter().filter_map(|t| t.tool()).collect();

        for tool in tools {
            let version = probe_version(tool).unwrap_or_else(|| UNKNOWN.to_string());
            debug!("{} version: {}", tool, version);
            self.tools.insert(tool.to_string(), version);
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), PostprocessError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| PostprocessError::Serialize {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, json).map_err(|source| PostprocessError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Version manifest written to {}", path.display());
        Ok(())
    }
}

/// Arguments that make `tool` report its version.
fn version_args(tool: &str) -> &'static [&'static str] {
    match tool {
        // bwa has no version flag; its usage text carries a `Version:` line
        "bwa" => &[],
        _ => &["--version"],
    }
}

/// Version reported by `tool`, or `None` if it cannot be determined.
pub fn probe_version(tool: &str) -> Option<String> {
    let output = Command::new(tool).args(version_args(tool)).output().ok()?;
    let text = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    parse_version_output(&text, output.status.success())
}

/// A `Version:` line wins; otherwise the first non-empty line of a
/// successful invocation.
fn parse_version_output(text: &str, success: bool) -> Option<String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let labelled = text
        .lines()
        .find_map(|l| l.trim().strip_prefix("Version:"))
        .map(|v| v.trim().to_string());

    match labelled {
        Some(version) => Some(version),
        None if success => lines.next().map(str::to_string),
        None => None,
    }
}
