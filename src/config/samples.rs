//! Sample Table Resolution
//!
//! Reads the comma-delimited sample table (one row per sample and lane),
//! groups rows into [`Sample`]s and classifies the run shape.
//!
//! ```text
//! sample,r1_path,r2_path
//! S1,reads/S1_L001_R1.fastq.gz,reads/S1_L001_R2.fastq.gz
//! S1,reads/S1_L002_R1.fastq.gz,reads/S1_L002_R2.fastq.gz
//! S2,reads/S2_R1.fastq.gz,reads/S2_R2.fastq.gz
//! ```
//!
//! A sample id appearing on more than one row puts the whole run in
//! [`RunShape::Pooled`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const SAMPLE_COLUMN: &str = "sample";
const R1_COLUMN: &str = "r1_path";
const R2_COLUMN: &str = "r2_path";

/// Which side of a paired-end read a file holds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadSide {
    R1,
    R2,
}

impl ReadSide {
    pub const BOTH: [ReadSide; 2] = [ReadSide::R1, ReadSide::R2];

    /// Value substituted for the `{read}` wildcard.
    pub fn wildcard_value(self) -> &'static str {
        match self {
            ReadSide::R1 => "1",
            ReadSide::R2 => "2",
        }
    }

    pub fn from_wildcard(value: &str) -> Option<Self> {
        match value {
            "1" => Some(ReadSide::R1),
            "2" => Some(ReadSide::R2),
            _ => None,
        }
    }
}

/// One lane's worth of paired-end read files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReadPair {
    pub r1: PathBuf,
    pub r2: PathBuf,
}

impl ReadPair {
    pub fn file(&self, side: ReadSide) -> &Path {
        match side {
            ReadSide::R1 => &self.r1,
            ReadSide::R2 => &self.r2,
        }
    }
}

/// A resolved sample: unique id and its raw read pairs in table order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub pairs: Vec<ReadPair>,
}

impl Sample {
    /// Raw files for one read side, in table order.
    pub fn raw_files(&self, side: ReadSide) -> Vec<PathBuf> {
        self.pairs.iter().map(|p| p.file(side).to_path_buf()).collect()
    }
}

/// Raw-input shape of the whole run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunShape {
    /// Every sample id appears on exactly one row
    Single,
    /// At least one sample id repeats; lanes must be pooled
    Pooled,
}

/// The loaded sample table.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleTable {
    samples: Vec<Sample>,
    shape: RunShape,
}

impl SampleTable {
    /// Loads a sample table, resolving relative read paths against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading sample table: {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::parse(&content, path, &base_dir)
    }

    /// Parses table text; `source` is only used in error messages.
    pub fn parse(content: &str, source: &Path, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut lines = content
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
            .filter(|(_, l)| !l.trim().is_empty());

        let Some((_, header)) = lines.next() else {
            return Err(ConfigError::EmptySampleTable(source.to_path_buf()));
        };

        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        let column_index = |name: &str| {
            columns
                .iter()
                .position(|c| *c == name)
                .ok_or_else(|| ConfigError::MissingColumn {
                    path: source.to_path_buf(),
                    column: name.to_string(),
                })
        };

        let sample_idx = column_index(SAMPLE_COLUMN)?;
        let r1_idx = column_index(R1_COLUMN)?;
        let r2_idx = column_index(R2_COLUMN)?;

        let mut rows: Vec<(String, ReadPair)> = Vec::new();

        for (line_no, line) in lines {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != columns.len() {
                return Err(ConfigError::MalformedRow {
                    path: source.to_path_buf(),
                    line: line_no,
                    reason: format!(
                        "expected {} fields, found {}",
                        columns.len(),
                        fields.len()
                    ),
                });
            }

            let malformed = |reason: &str| ConfigError::MalformedRow {
                path: source.to_path_buf(),
                line: line_no,
                reason: reason.to_string(),
            };

            let id = fields[sample_idx];
            if id.is_empty() {
                return Err(malformed("empty sample identifier"));
            }
            if !is_valid_sample_id(id) {
                return Err(malformed(
                    "sample identifier may only contain letters, digits, '.', '_' and '-'",
                ));
            }
            if fields[r1_idx].is_empty() || fields[r2_idx].is_empty() {
                return Err(malformed("empty read file path"));
            }

            let pair = ReadPair {
                r1: resolve(base_dir, fields[r1_idx]),
                r2: resolve(base_dir, fields[r2_idx]),
            };
            rows.push((id.to_string(), pair));
        }

        if rows.is_empty() {
            return Err(ConfigError::EmptySampleTable(source.to_path_buf()));
        }

        let shape = classify_run_shape(rows.iter().map(|(id, _)| id.as_str()));
        let samples = group_rows(rows);

        info!(
            "Resolved {} samples ({:?} mode)",
            samples.len(),
            shape
        );

        Ok(Self { samples, shape })
    }

    /// Builds a table directly from samples; the shape is derived from the pair counts.
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        let shape = if samples.iter().any(|s| s.pairs.len() > 1) {
            RunShape::Pooled
        } else {
            RunShape::Single
        };
        Self { samples, shape }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn shape(&self) -> RunShape {
        self.shape
    }

    pub fn get(&self, id: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|s| s.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Sample ids become path components and shell words, so only
/// `[A-Za-z0-9._-]` is accepted.
pub fn is_valid_sample_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Pooled iff any identifier occurs more than once.
pub fn classify_run_shape<'a>(ids: impl IntoIterator<Item = &'a str>) -> RunShape {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for id in ids {
        *counts.entry(id).or_default() += 1;
    }

    if counts.values().any(|&n| n > 1) {
        RunShape::Pooled
    } else {
        RunShape::Single
    }
}

/// Merges rows sharing an id, keeping first-appearance order of samples
/// and table order of pairs.
fn group_rows(rows: Vec<(String, ReadPair)>) -> Vec<Sample> {
    let mut samples: Vec<Sample> = Vec::new();

    for (id, pair) in rows {
        match samples.iter_mut().find(|s| s.id == id) {
            Some(sample) => {
                debug!("Pooling additional lane for sample '{}'", id);
                sample.pairs.push(pair);
            }
            None => samples.push(Sample {
                id,
                pairs: vec![pair],
            }),
        }
    }

    samples
}

fn resolve(base_dir: &Path, field: &str) -> PathBuf {
    let path = PathBuf::from(field);
    if path.is_relative() {
        base_dir.join(path)
    } else {
        path
    }
}
