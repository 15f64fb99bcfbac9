//! Stage Templates
//!
//! A [`StageTemplate`] describes one logical processing step, parameterized
//! by the `{sample}` and `{read}` wildcards. It declares
//! - named output patterns,
//! - where its inputs come from ([`InputSpec`]),
//! - fixed parameters drawn from the run configuration,
//! - the action to perform ([`Action`]) and how to treat tool failure
//!   ([`FailurePolicy`]),
//! - log and benchmark side channels, which never take part in dependency
//!   resolution,
//! - the [`Guard`] deciding whether the template is enabled for a plan.
//!
//! # Example
//!
//! ```
//! use ampliflow::workflow::StageTemplate;
//!
//! let template = StageTemplate::shell(
//!     "viral_mapping",
//!     "bwa",
//!     "bwa mem -t {threads} {params.reference} {input.r1} {input.r2} > {output.bam}",
//! )
//! .input("r1", "{sample}/03_trimmed/{sample}_R1_val_1.fq.gz")
//! .input("r2", "{sample}/03_trimmed/{sample}_R2_val_2.fq.gz")
//! .output("bam", "{sample}/06_mapping/{sample}.sorted.bam")
//! .param("reference", "/refs/MN908947.3.fasta")
//! .threads(4);
//!
//! assert_eq!(template.name, "viral_mapping");
//! assert_eq!(template.outputs.len(), 1);
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::pattern::{ArtifactPattern, WildcardBinding, READ, SAMPLE};
use super::policy::{PlanPolicy, RawInputPolicy};

/// Optional modules toggled by configuration flags.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    /// FreeBayes variant calling
    VariantCalling,
    /// breseq mutation analysis
    MutationAnalysis,
}

/// Condition under which a template takes part in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    /// Enabled only when the plan chose this raw-input policy
    RawInput(RawInputPolicy),
    /// Enabled only when the feature flag is on
    Feature(Feature),
}

impl Guard {
    pub fn allows(&self, policy: &PlanPolicy) -> bool {
        match self {
            Guard::Always => true,
            Guard::RawInput(p) => policy.raw_input == *p,
            Guard::Feature(f) => policy.is_enabled(*f),
        }
    }
}

/// What happens when the external tool exits non-zero.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The node fails and its dependents do not run
    Strict,
    /// Missing outputs are created empty and dependents proceed
    Placeholder,
}

/// An input or output pattern with the name used in command placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPattern {
    pub name: String,
    pub pattern: ArtifactPattern,
}

/// Source of a template's inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// Artifacts produced by upstream stages
    Artifacts(Vec<NamedPattern>),
    /// The sample's raw read files for the bound read side
    RawReads,
}

/// The work a node performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run a command template through bash
    Shell { tool: String, command: String },
    /// Symlink the single raw file to the output
    LinkRaw,
    /// Merge raw files and sort records by read identifier
    PoolAndSort,
}

/// A parameterized processing step.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTemplate {
    pub name: String,
    pub outputs: Vec<NamedPattern>,
    pub inputs: InputSpec,
    pub params: BTreeMap<String, String>,
    /// Share of the worker budget held while running
    pub threads: usize,
    pub action: Action,
    pub on_failure: FailurePolicy,
    pub log: Option<ArtifactPattern>,
    pub benchmark: Option<ArtifactPattern>,
    pub guard: Guard,
}

impl StageTemplate {
    fn base(name: impl Into<String>, inputs: InputSpec, action: Action) -> Self {
        Self {
            name: name.into().trim().to_string(),
            outputs: Vec::new(),
            inputs,
            params: BTreeMap::new(),
            threads: 1,
            action,
            on_failure: FailurePolicy::Strict,
            log: None,
            benchmark: None,
            guard: Guard::Always,
        }
    }

    /// A stage running an external tool through a shell command.
    pub fn shell(
        name: impl Into<String>,
        tool: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        let action = Action::Shell {
            tool: tool.into().trim().to_string(),
            command: command.into().trim().to_string(),
        };
        Self::base(name, InputSpec::Artifacts(Vec::new()), action)
    }

    /// A raw-input stage reading the sample's files directly.
    pub fn raw(name: impl Into<String>, action: Action) -> Self {
        Self::base(name, InputSpec::RawReads, action)
    }

    /// Adds a named upstream input. Ignored for raw-input stages.
    pub fn input(mut self, name: impl Into<String>, pattern: impl Into<ArtifactPattern>) -> Self {
        if let InputSpec::Artifacts(ref mut inputs) = self.inputs {
            inputs.push(NamedPattern {
                name: name.into(),
                pattern: pattern.into(),
            });
        }
        self
    }

    pub fn output(mut self, name: impl Into<String>, pattern: impl Into<ArtifactPattern>) -> Self {
        self.outputs.push(NamedPattern {
            name: name.into(),
            pattern: pattern.into(),
        });
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Tool failures produce empty placeholder outputs instead of failing.
    pub fn lenient(mut self) -> Self {
        self.on_failure = FailurePolicy::Placeholder;
        self
    }

    pub fn log(mut self, pattern: impl Into<ArtifactPattern>) -> Self {
        self.log = Some(pattern.into());
        self
    }

    pub fn benchmark(mut self, pattern: impl Into<ArtifactPattern>) -> Self {
        self.benchmark = Some(pattern.into());
        self
    }

    pub fn guarded(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    /// Tool name, if this stage invokes one.
    pub fn tool(&self) -> Option<&str> {
        match &self.action {
            Action::Shell { tool, .. } => Some(tool),
            _ => None,
        }
    }

    /// Wildcards appearing in the output patterns.
    pub fn wildcard_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for output in &self.outputs {
            for name in output.pattern.wildcard_names() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }
}

/// Concrete paths available to a command at render time.
pub struct RenderContext<'a> {
    pub inputs: &'a [(String, String)],
    pub outputs: &'a [(String, String)],
    pub params: &'a BTreeMap<String, String>,
    pub threads: usize,
    pub log: Option<&'a str>,
    pub binding: &'a WildcardBinding,
}

/// Quotes `value` for bash unless every character is shell-safe.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./+:=@%,".contains(c);
    if !value.is_empty() && value.chars().all(safe) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', "'\\''")))
    }
}

/// Resolves placeholders in a command template.
///
/// Supported placeholders:
/// - `{input.<name>}` / `{output.<name>}` / `{params.<name>}`
/// - `{input}` / `{output}` - all files, space separated
/// - `{threads}`, `{log}`, `{sample}`, `{read}`
///
/// Substituted values are shell-quoted where needed.
pub fn render_command(command: &str, ctx: &RenderContext<'_>) -> String {
    let mut text = command.to_string();

    for (name, path) in ctx.inputs {
        text = text.replace(&format!("{{input.{}}}", name), &shell_quote(path));
    }
    for (name, path) in ctx.outputs {
        text = text.replace(&format!("{{output.{}}}", name), &shell_quote(path));
    }
    for (name, value) in ctx.params {
        text = text.replace(&format!("{{params.{}}}", name), &shell_quote(value));
    }

    let all_inputs: Vec<Cow<'_, str>> = ctx.inputs.iter().map(|(_, p)| shell_quote(p)).collect();
    let all_outputs: Vec<Cow<'_, str>> = ctx.outputs.iter().map(|(_, p)| shell_quote(p)).collect();

    text = text
        .replace("{input}", &all_inputs.join(" "))
        .replace("{output}", &all_outputs.join(" "))
        .replace("{threads}", &ctx.threads.to_string())
        .replace("{log}", &shell_quote(ctx.log.unwrap_or("/dev/null")));

    for name in [SAMPLE, READ] {
        if let Some(value) = ctx.binding.get(name) {
            text = text.replace(&format!("{{{}}}", name), &shell_quote(value));
        }
    }

    text
}
