//! Node Invocation
//!
//! Runs a single planned node inside the result directory:
//! - output, log and benchmark directories are created and stale outputs
//!   removed
//! - built-in actions run in-process
//! - shell contracts run through a generated bash script with
//!   `set -euo pipefail`, stdout and stderr appended to the node log,
//!   while the process tree is sampled for the benchmark record
//! - the exit status and the declared outputs decide the [`RunResult`]

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::monitoring::ResourceMonitor;
use crate::workflow::graph::under;
use crate::workflow::{FailurePolicy, Node, ResolvedAction};

use super::builtin::{link_raw, pool_and_sort};
use super::scheduler::RunResult;

/// Interval between checks of a running child.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lines of the node log quoted in a failure reason.
const LOG_TAIL_LINES: usize = 5;

/// Executes `node` with relative paths resolved against `root`.
pub fn execute_node(node: &Node, root: &Path) -> RunResult {
    if let Err(e) = prepare(node, root) {
        return RunResult::Failure {
            reason: format!("Failed to prepare outputs: {}", e),
        };
    }

    match &node.action {
        ResolvedAction::LinkRaw { source, dest } => builtin_result(link_raw(source, &under(root, dest))),
        ResolvedAction::PoolAndSort { sources, dest } => {
            builtin_result(pool_and_sort(sources, &under(root, dest)))
        }
        ResolvedAction::Shell { command, .. } => run_shell(node, command, root),
    }
}

fn builtin_result(outcome: io::Result<()>) -> RunResult {
    match outcome {
        Ok(()) => RunResult::Success,
        Err(e) => RunResult::Failure {
            reason: e.to_string(),
        },
    }
}

/// Creates parent directories and removes outputs left by earlier attempts.
fn prepare(node: &Node, root: &Path) -> io::Result<()> {
    let side_channels = node.log.iter().chain(node.benchmark.iter());
    for path in node.outputs.iter().chain(side_channels) {
        if let Some(parent) = under(root, path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }

    for output in &node.outputs {
        let path = under(root, output);
        if fs::symlink_metadata(&path).is_ok() {
            fs::remove_file(&path)?;
            debug!("Removed stale output: {}", path.display());
        }
    }

    if let Some(log) = &node.log {
        File::create(under(root, log))?;
    }
    Ok(())
}

/// Writes the bash wrapper for a node's command.
fn create_execution_script(root: &Path, node: &Node, command: &str) -> io::Result<PathBuf> {
    let script_dir = root.join(".ampliflow").join("scripts");
    fs::create_dir_all(&script_dir)?;

    let file_name: String = node
        .id
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let script_path = script_dir.join(format!("{}.sh", file_name));

    let mut file = File::create(&script_path)?;
    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -euo pipefail")?;
    writeln!(file, "{}", command)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

fn log_stdio(log: Option<&Path>) -> io::Result<(Stdio, Stdio)> {
    match log {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok((Stdio::from(file.try_clone()?), Stdio::from(file)))
        }
        None => Ok((Stdio::null(), Stdio::null())),
    }
}

fn run_shell(node: &Node, command: &str, root: &Path) -> RunResult {
    let log_path = node.log.as_ref().map(|p| under(root, p));

    let spawned = create_execution_script(root, node, command).and_then(|script| {
        let (stdout, stderr) = log_stdio(log_path.as_deref())?;
        let child = Command::new("bash")
            .arg(&script)
            .current_dir(root)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        Ok((script, child))
    });

    let (script, mut child) = match spawned {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("{} could not be started: {}", node.id, e);
            return RunResult::Failure {
                reason: format!("Failed to start bash: {}", e),
            };
        }
    };

    let started = Instant::now();
    let mut monitor = ResourceMonitor::new(child.id());
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                monitor.sample();
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = fs::remove_file(&script) {
        warn!("Failed to clean up script {}: {}", script.display(), e);
    }

    if let Some(benchmark) = &node.benchmark {
        let path = under(root, benchmark);
        if let Err(e) = monitor.benchmark(started.elapsed()).write(&path) {
            warn!("Failed to write benchmark {}: {}", path.display(), e);
        }
    }

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return RunResult::Failure {
                reason: format!("Failed to wait for process: {}", e),
            }
        }
    };

    if status.success() {
        let missing = missing_outputs(node, root);
        if missing.is_empty() {
            return RunResult::Success;
        }
        return RunResult::Failure {
            reason: format!("Exited 0 but outputs are missing: {}", missing.join(", ")),
        };
    }

    let exit_code = status.code();
    match node.on_failure {
        FailurePolicy::Strict => {
            let mut reason = match exit_code {
                Some(code) => format!("Exit code {}", code),
                None => "Terminated by signal".to_string(),
            };
            if let Some(tail) = log_path.as_deref().and_then(log_tail) {
                reason.push_str(&format!("; log tail:\n{}", tail));
            }
            RunResult::Failure { reason }
        }
        FailurePolicy::Placeholder => {
            for output in missing_outputs(node, root) {
                if let Err(e) = File::create(under(root, Path::new(&output))) {
                    return RunResult::Failure {
                        reason: format!("Failed to create placeholder '{}': {}", output, e),
                    };
                }
            }
            warn!(
                "{} exited with {:?}; placeholder outputs created",
                node.id, exit_code
            );
            RunResult::FailureWithPlaceholder { exit_code }
        }
    }
}

fn missing_outputs(node: &Node, root: &Path) -> Vec<String> {
    node.outputs
        .iter()
        .filter(|p| !under(root, p).exists())
        .map(|p| p.display().to_string())
        .collect()
}

fn log_tail(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    Some(lines[start..].join("\n"))
}
