//! Run Ledger
//!
//! Persists the terminal result of every node to
//! `<result_dir>/.ampliflow/run_state.json` after each node finishes, so
//! postprocessing (and a later run) can tell which stages produced
//! placeholders and which never ran.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::execution::RunResult;

use super::graph::NodeId;
use super::layout;

/// Result of a single node in the ledger.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NodeRecord {
    pub template: String,
    pub sample: Option<String>,
    pub result: RunResult,
    pub finished_at: DateTime<Local>,
}

/// Persistent record of a run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunLedger {
    pub run_name: String,
    pub started_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    /// Keyed by the node's display id
    pub records: BTreeMap<String, NodeRecord>,
}

impl RunLedger {
    pub fn new(run_name: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            run_name: run_name.into(),
            started_at: now,
            updated_at: now,
            records: BTreeMap::new(),
        }
    }

    /// Ledger location for a result directory.
    pub fn path_for(result_dir: &Path) -> PathBuf {
        result_dir.join(layout::RUN_STATE)
    }

    pub fn save(&self, result_dir: &Path) -> Result<(), ExecutionError> {
        let path = Self::path_for(result_dir);
        let ledger_error = |message: String| ExecutionError::Ledger {
            path: path.clone(),
            message,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ledger_error(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| ledger_error(e.to_string()))?;
        fs::write(&path, json).map_err(|e| ledger_error(e.to_string()))?;

        debug!("Saved run state to {}", path.display());
        Ok(())
    }

    pub fn load(result_dir: &Path) -> Result<Self, ExecutionError> {
        let path = Self::path_for(result_dir);
        let content = fs::read_to_string(&path).map_err(|e| ExecutionError::Ledger {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let ledger: RunLedger =
            serde_json::from_str(&content).map_err(|e| ExecutionError::Ledger {
                path: path.clone(),
                message: e.to_string(),
            })?;

        info!(
            "Loaded run state from {} ({} nodes)",
            path.display(),
            ledger.records.len()
        );
        Ok(ledger)
    }

    /// Records a node's result, replacing any earlier record.
    pub fn record(&mut self, id: &NodeId, result: RunResult) {
        let now = Local::now();
        self.records.insert(
            id.to_string(),
            NodeRecord {
                template: id.template.clone(),
                sample: id.sample().map(str::to_string),
                result,
                finished_at: now,
            },
        );
        self.updated_at = now;
    }

    /// Drops records of nodes not in `ids`; returns how many were dropped.
    pub fn retain_nodes<'a>(&mut self, ids: impl IntoIterator<Item = &'a NodeId>) -> usize {
        let keep: BTreeSet<String> = ids.into_iter().map(NodeId::to_string).collect();
        let before = self.records.len();
        self.records.retain(|key, _| keep.contains(key));
        before - self.records.len()
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.records.get(&id.to_string())
    }

    /// Templates that produced placeholder outputs for `sample`.
    pub fn placeholder_stages(&self, sample: &str) -> Vec<String> {
        let mut stages: Vec<String> = self
            .records
            .values()
            .filter(|r| r.sample.as_deref() == Some(sample))
            .filter(|r| matches!(r.result, RunResult::FailureWithPlaceholder { .. }))
            .map(|r| r.template.clone())
            .collect();
        stages.dedup();
        stages
    }

    /// Display ids of nodes that failed or never ran.
    pub fn unfinished(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|(_, r)| !r.result.proceeds())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
