//! Rule Graph Builder
//!
//! Resolves requested target artifacts backward into an immutable
//! [`Plan`]: one [`Node`] per (template, binding) pair and one [`Edge`] per
//! consumed artifact. Every structural problem is reported as a
//! [`PlanningError`] before anything executes.
//!
//! Node paths are relative to the result directory, except raw reads which
//! are kept as given in the sample table.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::{ReadSide, SampleTable};
use crate::error::PlanningError;

use super::pattern::{ArtifactPattern, WildcardBinding, READ, SAMPLE};
use super::policy::PlanPolicy;
use super::registry::StageRegistry;
use super::template::{render_command, Action, FailurePolicy, InputSpec, RenderContext, StageTemplate};

/// Identity of a node: its template and the binding it was instantiated with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub template: String,
    pub binding: WildcardBinding,
}

impl NodeId {
    pub fn new(template: impl Into<String>, binding: WildcardBinding) -> Self {
        Self {
            template: template.into(),
            binding,
        }
    }

    pub fn sample(&self) -> Option<&str> {
        self.binding.sample()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.binding.is_empty() {
            write!(f, "{}", self.template)
        } else {
            write!(f, "{}[{}]", self.template, self.binding)
        }
    }
}

/// A node's action with every placeholder resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAction {
    Shell { tool: String, command: String },
    LinkRaw { source: PathBuf, dest: PathBuf },
    PoolAndSort { sources: Vec<PathBuf>, dest: PathBuf },
}

impl ResolvedAction {
    /// Human readable form, used for dry runs.
    pub fn describe(&self) -> String {
        match self {
            ResolvedAction::Shell { command, .. } => command.clone(),
            ResolvedAction::LinkRaw { source, dest } => {
                format!("ln -s {} {}", source.display(), dest.display())
            }
            ResolvedAction::PoolAndSort { sources, dest } => {
                let sources: Vec<String> = sources.iter().map(|p| p.display().to_string()).collect();
                format!("pool and sort [{}] -> {}", sources.join(" "), dest.display())
            }
        }
    }
}

/// A template instantiated with one binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub log: Option<PathBuf>,
    pub benchmark: Option<PathBuf>,
    pub threads: usize,
    pub action: ResolvedAction,
    pub on_failure: FailurePolicy,
}

/// Resolves a node path against the result directory.
pub fn under(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

impl Node {
    pub fn outputs_exist(&self, root: &Path) -> bool {
        !self.outputs.is_empty() && self.outputs.iter().all(|f| under(root, f).exists())
    }

    /// True if any input is newer than the oldest output, or outputs are missing.
    pub fn outputs_outdated(&self, root: &Path) -> bool {
        if !self.outputs_exist(root) {
            return true;
        }

        let newest_input = self
            .inputs
            .iter()
            .filter_map(|f| fs::metadata(under(root, f)).ok())
            .filter_map(|m| m.modified().ok())
            .max();

        let oldest_output = self
            .outputs
            .iter()
            .filter_map(|f| fs::metadata(under(root, f)).ok())
            .filter_map(|m| m.modified().ok())
            .min();

        match (newest_input, oldest_output) {
            (Some(input_time), Some(output_time)) => input_time > output_time,
            (None, Some(_)) => false,
            _ => true,
        }
    }

    pub fn should_run(&self, root: &Path, force: bool) -> bool {
        force || self.outputs_outdated(root)
    }
}

/// `from` produces `artifact`, which `to` consumes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub artifact: String,
}

/// An immutable, acyclic execution plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub policy: PlanPolicy,
    pub nodes: BTreeMap<NodeId, Node>,
    pub edges: BTreeSet<Edge>,
    pub targets: Vec<String>,
    /// Adjacency built once from `edges`
    predecessors: BTreeMap<NodeId, BTreeSet<NodeId>>,
    successors: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Plan {
    pub fn new(
        policy: PlanPolicy,
        nodes: BTreeMap<NodeId, Node>,
        edges: BTreeSet<Edge>,
        targets: Vec<String>,
    ) -> Self {
        let mut predecessors: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut successors: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for edge in &edges {
            predecessors
                .entry(edge.to.clone())
                .or_default()
                .insert(edge.from.clone());
            successors
                .entry(edge.from.clone())
                .or_default()
                .insert(edge.to.clone());
        }

        Self {
            policy,
            nodes,
            edges,
            targets,
            predecessors,
            successors,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains_template(&self, name: &str) -> bool {
        self.nodes.keys().any(|id| id.template == name)
    }

    /// Direct producers of a node's inputs.
    pub fn dependencies(&self, id: &NodeId) -> BTreeSet<&NodeId> {
        self.predecessors
            .get(id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Direct consumers of a node's outputs.
    pub fn dependents(&self, id: &NodeId) -> BTreeSet<&NodeId> {
        self.successors
            .get(id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Every node downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for next in self.dependents(current) {
                if seen.insert(next.clone()) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Kahn's algorithm; ties are broken by node ordering so the result
    /// is stable across runs.
    pub fn topological_order(&self) -> Vec<&NodeId> {
        let mut in_degree: BTreeMap<&NodeId, usize> =
            self.nodes.keys().map(|id| (id, 0)).collect();
        for edge in &self.edges {
            if let Some(degree) = in_degree.get_mut(&edge.to) {
                *degree += 1;
            }
        }

        let mut ready: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = ready.pop_first() {
            order.push(current);
            for next in self.dependents(current) {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        debug!("Topological order: {} of {} nodes", order.len(), self.nodes.len());
        order
    }
}

/// Builds a [`Plan`] by backward resolution from target artifacts.
pub struct RuleGraphBuilder<'a> {
    registry: &'a StageRegistry,
    samples: &'a SampleTable,
    policy: PlanPolicy,
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeSet<Edge>,
    in_progress: Vec<NodeId>,
}

impl<'a> RuleGraphBuilder<'a> {
    pub fn new(registry: &'a StageRegistry, samples: &'a SampleTable, policy: PlanPolicy) -> Self {
        Self {
            registry,
            samples,
            policy,
            nodes: BTreeMap::new(),
            edges: BTreeSet::new(),
            in_progress: Vec::new(),
        }
    }

    /// Plans the registry's default targets for every sample.
    pub fn build_default(self) -> Result<Plan, PlanningError> {
        let targets = self.registry.default_targets(self.samples, &self.policy);
        self.build(&targets)
    }

    pub fn build(mut self, targets: &[String]) -> Result<Plan, PlanningError> {
        for target in targets {
            self.resolve_artifact(target, "target")?;
        }

        info!(
            "Planned {} nodes and {} edges for {} targets",
            self.nodes.len(),
            self.edges.len(),
            targets.len()
        );

        Ok(Plan::new(
            self.policy,
            self.nodes,
            self.edges,
            targets.to_vec(),
        ))
    }

    fn accepts(&self, name: &str, value: &str) -> bool {
        match name {
            SAMPLE => self.samples.contains(value),
            READ => ReadSide::from_wildcard(value).is_some(),
            _ => true,
        }
    }

    /// Finds the single enabled producer of `artifact` and instantiates it.
    fn resolve_artifact(&mut self, artifact: &str, required_by: &str) -> Result<NodeId, PlanningError> {
        let registry: &'a StageRegistry = self.registry;
        let mut producers: Vec<(&'a StageTemplate, WildcardBinding)> = Vec::new();

        for template in registry.enabled(&self.policy) {
            let binding = template
                .outputs
                .iter()
                .find_map(|o| o.pattern.matches(artifact, |n, v| self.accepts(n, v)));
            if let Some(binding) = binding {
                producers.push((template, binding));
            }
        }

        match producers.len() {
            0 => Err(PlanningError::UnresolvedInput {
                artifact: artifact.to_string(),
                required_by: required_by.to_string(),
            }),
            1 => {
                let (template, binding) = producers.remove(0);
                self.instantiate(template, binding)
            }
            _ => Err(PlanningError::AmbiguousProducer {
                artifact: artifact.to_string(),
                producers: producers.iter().map(|(t, _)| t.name.clone()).collect(),
            }),
        }
    }

    fn instantiate(
        &mut self,
        template: &'a StageTemplate,
        binding: WildcardBinding,
    ) -> Result<NodeId, PlanningError> {
        let id = NodeId::new(&template.name, binding);

        if let Some(start) = self.in_progress.iter().position(|n| n == &id) {
            let mut chain: Vec<String> = self.in_progress[start..].iter().map(|n| n.to_string()).collect();
            chain.push(id.to_string());
            return Err(PlanningError::Cycle(chain.join(" -> ")));
        }
        if self.nodes.contains_key(&id) {
            return Ok(id);
        }

        self.in_progress.push(id.clone());
        let node = self.resolve_node(template, &id);
        self.in_progress.pop();

        let node = node?;
        debug!("Instantiated {}", id);
        self.nodes.insert(id.clone(), node);
        Ok(id)
    }

    fn resolve_node(&mut self, template: &'a StageTemplate, id: &NodeId) -> Result<Node, PlanningError> {
        let binding = &id.binding;
        let substitute = |pattern: &ArtifactPattern| {
            pattern
                .substitute(binding)
                .map_err(|wildcard| PlanningError::UnboundWildcard {
                    template: template.name.clone(),
                    pattern: pattern.to_string(),
                    wildcard,
                })
        };

        let mut outputs = Vec::with_capacity(template.outputs.len());
        for output in &template.outputs {
            outputs.push((output.name.clone(), substitute(&output.pattern)?));
        }
        let log = template.log.as_ref().map(&substitute).transpose()?;
        let benchmark = template.benchmark.as_ref().map(&substitute).transpose()?;

        let mut inputs: Vec<(String, String)> = Vec::new();
        match &template.inputs {
            InputSpec::Artifacts(patterns) => {
                for input in patterns {
                    let artifact = substitute(&input.pattern)?;
                    let producer = self.resolve_artifact(&artifact, &id.to_string())?;
                    self.edges.insert(Edge {
                        from: producer,
                        to: id.clone(),
                        artifact: artifact.clone(),
                    });
                    inputs.push((input.name.clone(), artifact));
                }
            }
            InputSpec::RawReads => {
                for path in self.raw_inputs(template, binding)? {
                    inputs.push(("reads".to_string(), path.display().to_string()));
                }
            }
        }

        let action = match &template.action {
            Action::Shell { tool, command } => {
                let ctx = RenderContext {
                    inputs: &inputs,
                    outputs: &outputs,
                    params: &template.params,
                    threads: template.threads,
                    log: log.as_deref(),
                    binding,
                };
                ResolvedAction::Shell {
                    tool: tool.clone(),
                    command: render_command(command, &ctx),
                }
            }
            Action::LinkRaw | Action::PoolAndSort => {
                let mut sources: Vec<PathBuf> = inputs.iter().map(|(_, p)| PathBuf::from(p)).collect();
                let dest = outputs
                    .first()
                    .map(|(_, p)| PathBuf::from(p))
                    .unwrap_or_default();
                if sources.len() == 1 {
                    ResolvedAction::LinkRaw {
                        source: sources.remove(0),
                        dest,
                    }
                } else {
                    ResolvedAction::PoolAndSort { sources, dest }
                }
            }
        };

        Ok(Node {
            id: id.clone(),
            inputs: inputs.into_iter().map(|(_, p)| PathBuf::from(p)).collect(),
            outputs: outputs.into_iter().map(|(_, p)| PathBuf::from(p)).collect(),
            log: log.map(PathBuf::from),
            benchmark: benchmark.map(PathBuf::from),
            threads: template.threads,
            action,
            on_failure: template.on_failure,
        })
    }

    /// The sample's raw files for the bound read side; each must exist.
    fn raw_inputs(&self, template: &StageTemplate, binding: &WildcardBinding) -> Result<Vec<PathBuf>, PlanningError> {
        let unbound = |wildcard: &str| PlanningError::UnboundWildcard {
            template: template.name.clone(),
            pattern: "<raw reads>".to_string(),
            wildcard: wildcard.to_string(),
        };

        let sample_id = binding.sample().ok_or_else(|| unbound(SAMPLE))?;
        let side = binding
            .read()
            .and_then(ReadSide::from_wildcard)
            .ok_or_else(|| unbound(READ))?;
        let sample = self.samples.get(sample_id).ok_or_else(|| unbound(SAMPLE))?;

        let files = sample.raw_files(side);
        for path in &files {
            if !path.is_file() {
                return Err(PlanningError::MissingRawInput {
                    sample: sample_id.to_string(),
                    path: path.clone(),
                });
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::tests::MINIMAL_CONFIG;
    use crate::config::{ReadPair, RunConfig, Sample};
    use crate::workflow::policy::RawInputPolicy;
    use crate::workflow::template::Guard;
    use tempfile::{tempdir, TempDir};

    /// Writes raw read files and returns a table with `lanes[i]` pairs for sample i.
    fn raw_table(dir: &TempDir, lanes: &[usize]) -> SampleTable {
        let samples = lanes
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let id = format!("S{}", i + 1);
                let pairs = (0..n)
                    .map(|l| {
                        let r1 = dir.path().join(format!("{}_L{}_R1.fastq.gz", id, l));
                        let r2 = dir.path().join(format!("{}_L{}_R2.fastq.gz", id, l));
                        fs::write(&r1, "").unwrap();
                        fs::write(&r2, "").unwrap();
                        ReadPair { r1, r2 }
                    })
                    .collect();
                Sample { id, pairs }
            })
            .collect();
        SampleTable::from_samples(samples)
    }

    fn config() -> RunConfig {
        RunConfig::from_yaml_str(MINIMAL_CONFIG, Path::new("/runs")).unwrap()
    }

    fn policy(raw_input: RawInputPolicy, variant_calling: bool, mutation_analysis: bool) -> PlanPolicy {
        PlanPolicy {
            raw_input,
            variant_calling,
            mutation_analysis,
        }
    }

    fn plan_standard(samples: &SampleTable, policy: PlanPolicy) -> Result<Plan, PlanningError> {
        let registry = StageRegistry::standard(&config());
        RuleGraphBuilder::new(&registry, samples, policy).build_default()
    }

    fn id(template: &str, sample: &str) -> NodeId {
        NodeId::new(template, WildcardBinding::for_sample(sample))
    }

    #[test]
    fn test_node_id_display() {
        let node = NodeId::new("raw_fastqc", WildcardBinding::for_sample("S1").with(READ, "1"));
        assert_eq!(node.to_string(), "raw_fastqc[read=1,sample=S1]");
        assert_eq!(NodeId::new("summary", WildcardBinding::new()).to_string(), "summary");
    }

    #[test]
    fn test_standard_plan_single_sample() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1]);
        let plan = plan_standard(&samples, policy(RawInputPolicy::DirectLink, false, false)).unwrap();

        // 2 raw links, 2 raw fastqc, host removal, trimming, 2 trimmed fastqc,
        // kraken2, mapping, primer trimming, coverage, consensus, ivar, lineage
        assert_eq!(plan.len(), 15);
        assert!(plan.contains_template("raw_reads_link"));
        assert!(!plan.contains_template("raw_reads_pool_sort"));
        assert!(!plan.contains_template("freebayes"));
        assert!(!plan.contains_template("breseq"));

        let mapping = plan.node(&id("viral_mapping", "S1")).unwrap();
        assert_eq!(mapping.threads, 4);
        assert_eq!(mapping.outputs, vec![PathBuf::from("S1/06_mapping/S1.sorted.bam")]);
        assert_eq!(mapping.log, Some(PathBuf::from("S1/logs/viral_mapping.log")));
        match &mapping.action {
            ResolvedAction::Shell { tool, command } => {
                assert_eq!(tool, "bwa");
                assert!(command.contains("S1/03_trimmed/S1_R1_val_1.fq.gz"));
                assert!(command.contains("/runs/resources/MN908947.3.fasta"));
                assert!(!command.contains('{'));
            }
            other => panic!("Expected shell action, got {:?}", other),
        }

        let deps: Vec<String> = plan
            .dependencies(&id("viral_mapping", "S1"))
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(deps, vec!["adapter_trimming[sample=S1]"]);
    }

    #[test]
    fn test_every_shell_command_fully_rendered() {
        let dir = tempdir().unwrap();
        let temp_ref = dir.path().join("ref.gbk");
        fs::write(&temp_ref, "LOCUS").unwrap();
        let cfg = RunConfig {
            breseq_reference: Some(temp_ref),
            ..config()
        };
        let registry = StageRegistry::standard(&cfg);
        let samples = raw_table(&dir, &[2, 1]);
        let plan = RuleGraphBuilder::new(&registry, &samples, policy(RawInputPolicy::PoolAndSort, true, true))
            .build_default()
            .unwrap();

        for node in plan.nodes.values() {
            if let ResolvedAction::Shell { command, .. } = &node.action {
                assert!(!command.contains("{input"), "{}: {}", node.id, command);
                assert!(!command.contains("{output"), "{}: {}", node.id, command);
                assert!(!command.contains("{params"), "{}: {}", node.id, command);
                assert!(!command.contains("{sample}"), "{}: {}", node.id, command);
            }
        }
    }

    #[test]
    fn test_planning_is_deterministic() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1, 1, 1]);
        let p = policy(RawInputPolicy::DirectLink, true, false);

        let first = plan_standard(&samples, p).unwrap();
        let second = plan_standard(&samples, p).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.topological_order(), second.topological_order());
    }

    #[test]
    fn test_disabling_modules_removes_their_nodes() {
        let dir = tempdir().unwrap();
        let temp_ref = dir.path().join("ref.gbk");
        fs::write(&temp_ref, "LOCUS").unwrap();
        let cfg = RunConfig {
            breseq_reference: Some(temp_ref),
            ..config()
        };
        let registry = StageRegistry::standard(&cfg);
        let samples = raw_table(&dir, &[1, 1]);

        let with = RuleGraphBuilder::new(&registry, &samples, policy(RawInputPolicy::DirectLink, true, true))
            .build_default()
            .unwrap();
        let without = RuleGraphBuilder::new(&registry, &samples, policy(RawInputPolicy::DirectLink, true, false))
            .build_default()
            .unwrap();

        assert!(with.contains_template("breseq"));
        assert!(!without.contains_template("breseq"));
        assert_eq!(with.len(), without.len() + 2);
        assert!(without.contains_template("freebayes"));
    }

    #[test]
    fn test_pooled_run_uses_pool_and_sort_for_every_sample() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[2, 1]);
        let plan = plan_standard(&samples, policy(RawInputPolicy::PoolAndSort, false, false)).unwrap();

        assert!(!plan.contains_template("raw_reads_link"));
        let pooled = NodeId::new("raw_reads_pool_sort", WildcardBinding::for_sample("S1").with(READ, "1"));
        match &plan.node(&pooled).unwrap().action {
            ResolvedAction::PoolAndSort { sources, dest } => {
                assert_eq!(sources.len(), 2);
                assert_eq!(dest, &PathBuf::from("S1/00_raw/S1_R1.fastq.gz"));
            }
            other => panic!("Expected pool and sort, got {:?}", other),
        }

        // a single-lane sample degrades to a link even under pooling
        let single = NodeId::new("raw_reads_pool_sort", WildcardBinding::for_sample("S2").with(READ, "2"));
        assert!(matches!(
            plan.node(&single).unwrap().action,
            ResolvedAction::LinkRaw { .. }
        ));
    }

    #[test]
    fn test_missing_raw_input() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1]);
        fs::remove_file(&samples.samples()[0].pairs[0].r2).unwrap();

        let err = plan_standard(&samples, policy(RawInputPolicy::DirectLink, false, false)).unwrap_err();
        assert!(matches!(err, PlanningError::MissingRawInput { ref sample, .. } if sample == "S1"));
    }

    #[test]
    fn test_unresolved_target() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1]);
        let registry = StageRegistry::standard(&config());
        let err = RuleGraphBuilder::new(&registry, &samples, policy(RawInputPolicy::DirectLink, false, false))
            .build(&["S9/08_coverage/S9_depth.txt".to_string()])
            .unwrap_err();
        assert!(matches!(err, PlanningError::UnresolvedInput { .. }));
    }

    #[test]
    fn test_ambiguous_producer() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1]);
        let mut registry = StageRegistry::new();
        registry
            .register(StageTemplate::shell("a", "touch", "touch {output}").output("out", "{sample}.txt"))
            .unwrap();
        registry
            .register(StageTemplate::shell("b", "touch", "touch {output}").output("out", "{sample}.txt"))
            .unwrap();

        let err = RuleGraphBuilder::new(&registry, &samples, policy(RawInputPolicy::DirectLink, false, false))
            .build(&["S1.txt".to_string()])
            .unwrap_err();
        assert_eq!(
            err,
            PlanningError::AmbiguousProducer {
                artifact: "S1.txt".into(),
                producers: vec!["a".into(), "b".into()],
            }
        );
    }

    #[test]
    fn test_guard_resolves_ambiguity() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1]);
        let mut registry = StageRegistry::new();
        registry
            .register(
                StageTemplate::shell("a", "touch", "touch {output}")
                    .output("out", "{sample}.txt")
                    .guarded(Guard::RawInput(RawInputPolicy::DirectLink)),
            )
            .unwrap();
        registry
            .register(
                StageTemplate::shell("b", "touch", "touch {output}")
                    .output("out", "{sample}.txt")
                    .guarded(Guard::RawInput(RawInputPolicy::PoolAndSort)),
            )
            .unwrap();

        let plan = RuleGraphBuilder::new(&registry, &samples, policy(RawInputPolicy::PoolAndSort, false, false))
            .build(&["S1.txt".to_string()])
            .unwrap();
        assert!(plan.contains_template("b"));
        assert!(!plan.contains_template("a"));
    }

    #[test]
    fn test_cycle_detected() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1]);
        let mut registry = StageRegistry::new();
        registry
            .register(
                StageTemplate::shell("a", "cp", "cp {input} {output}")
                    .input("in", "{sample}.b")
                    .output("out", "{sample}.a"),
            )
            .unwrap();
        registry
            .register(
                StageTemplate::shell("b", "cp", "cp {input} {output}")
                    .input("in", "{sample}.a")
                    .output("out", "{sample}.b"),
            )
            .unwrap();

        let err = RuleGraphBuilder::new(&registry, &samples, policy(RawInputPolicy::DirectLink, false, false))
            .build(&["S1.a".to_string()])
            .unwrap_err();
        match err {
            PlanningError::Cycle(chain) => {
                assert_eq!(chain, "a[sample=S1] -> b[sample=S1] -> a[sample=S1]");
            }
            other => panic!("Expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unbound_wildcard() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1]);
        let mut registry = StageRegistry::new();
        registry
            .register(
                StageTemplate::shell("a", "cp", "cp {input} {output}")
                    .input("in", "{sample}_R{read}.fq")
                    .output("out", "{sample}.bam"),
            )
            .unwrap();

        let err = RuleGraphBuilder::new(&registry, &samples, policy(RawInputPolicy::DirectLink, false, false))
            .build(&["S1.bam".to_string()])
            .unwrap_err();
        assert!(matches!(
            err,
            PlanningError::UnboundWildcard { ref wildcard, .. } if wildcard == "read"
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1, 1]);
        let plan = plan_standard(&samples, policy(RawInputPolicy::DirectLink, false, false)).unwrap();

        let downstream = plan.transitive_dependents(&id("viral_mapping", "S1"));
        let names: BTreeSet<&str> = downstream.iter().map(|n| n.template.as_str()).collect();
        assert_eq!(
            names,
            ["primer_trimming", "coverage", "consensus", "ivar_variants", "lineage"]
                .into_iter()
                .collect()
        );
        assert!(downstream.iter().all(|n| n.sample() == Some("S1")));
    }

    #[test]
    fn test_adjacency_matches_edges() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1, 2]);
        let plan = plan_standard(&samples, policy(RawInputPolicy::PoolAndSort, true, false)).unwrap();

        for id in plan.nodes.keys() {
            let from_edges: BTreeSet<&NodeId> =
                plan.edges.iter().filter(|e| &e.to == id).map(|e| &e.from).collect();
            let to_edges: BTreeSet<&NodeId> =
                plan.edges.iter().filter(|e| &e.from == id).map(|e| &e.to).collect();
            assert_eq!(plan.dependencies(id), from_edges, "dependencies of {}", id);
            assert_eq!(plan.dependents(id), to_edges, "dependents of {}", id);
        }
        assert!(plan.dependencies(&id("no_such_stage", "S1")).is_empty());
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let dir = tempdir().unwrap();
        let samples = raw_table(&dir, &[1, 2]);
        let plan = plan_standard(&samples, policy(RawInputPolicy::PoolAndSort, true, false)).unwrap();

        let order = plan.topological_order();
        assert_eq!(order.len(), plan.len());
        let position: BTreeMap<&NodeId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for edge in &plan.edges {
            assert!(position[&edge.from] < position[&edge.to], "{} before {}", edge.from, edge.to);
        }
    }

    #[test]
    fn test_should_run_freshness() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("in.txt"), "x").unwrap();

        let node = Node {
            id: id("copy", "S1"),
            inputs: vec![PathBuf::from("in.txt")],
            outputs: vec![PathBuf::from("out.txt")],
            log: None,
            benchmark: None,
            threads: 1,
            action: ResolvedAction::Shell {
                tool: "cp".into(),
                command: "cp in.txt out.txt".into(),
            },
            on_failure: FailurePolicy::Strict,
        };

        assert!(!node.outputs_exist(root));
        assert!(node.should_run(root, false));

        fs::write(root.join("out.txt"), "x").unwrap();
        assert!(node.outputs_exist(root));
        assert!(!node.should_run(root, false));
        assert!(node.should_run(root, true));
    }
}
