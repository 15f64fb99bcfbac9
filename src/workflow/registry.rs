//! Stage Template Registry
//!
//! Holds the enabled-or-not catalogue of [`StageTemplate`]s and the default
//! targets that make up the full-batch run.

use std::collections::HashSet;

use log::error;

use crate::config::{ReadSide, RunConfig, SampleTable};

use super::layout;
use super::pattern::{ArtifactPattern, WildcardBinding, READ};
use super::policy::{PlanPolicy, RawInputPolicy};
use super::template::{Action, Feature, Guard, StageTemplate};

/// A default target pattern, included when its guard allows it.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub pattern: ArtifactPattern,
    pub guard: Guard,
}

/// Catalogue of stage templates.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    templates: Vec<StageTemplate>,
    targets: Vec<TargetSpec>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a template. Template names must be unique.
    pub fn register(&mut self, template: StageTemplate) -> Result<(), String> {
        if template.name.is_empty() {
            return Err("Stage name cannot be empty".into());
        }
        if self.get(&template.name).is_some() {
            return Err(format!("Duplicate stage name '{}'", template.name));
        }
        if template.outputs.is_empty() {
            return Err(format!("Stage '{}' has no outputs", template.name));
        }
        self.templates.push(template);
        Ok(())
    }

    /// Adds a default target pattern for the `all` target.
    pub fn add_target(&mut self, pattern: impl Into<ArtifactPattern>, guard: Guard) {
        self.targets.push(TargetSpec {
            pattern: pattern.into(),
            guard,
        });
    }

    pub fn templates(&self) -> &[StageTemplate] {
        &self.templates
    }

    pub fn get(&self, name: &str) -> Option<&StageTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// Templates whose guard allows them under `policy`, in registration order.
    pub fn enabled<'s>(&'s self, policy: &PlanPolicy) -> impl Iterator<Item = &'s StageTemplate> + 's {
        let policy = *policy;
        self.templates.iter().filter(move |t| t.guard.allows(&policy))
    }

    /// Concrete default targets for every sample, in table order.
    pub fn default_targets(&self, samples: &SampleTable, policy: &PlanPolicy) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for sample in samples.samples() {
            for spec in self.targets.iter().filter(|t| t.guard.allows(policy)) {
                let base = WildcardBinding::for_sample(&sample.id);
                let bindings: Vec<WildcardBinding> =
                    if spec.pattern.wildcard_names().contains(&READ) {
                        ReadSide::BOTH
                            .iter()
                            .map(|side| base.clone().with(READ, side.wildcard_value()))
                            .collect()
                    } else {
                        vec![base]
                    };

                for binding in bindings {
                    if let Ok(path) = spec.pattern.substitute(&binding) {
                        if seen.insert(path.clone()) {
                            targets.push(path);
                        }
                    }
                }
            }
        }

        targets
    }

    /// The standard amplicon catalogue, parameterized by `config`.
    pub fn standard(config: &RunConfig) -> Self {
        let mut registry = Self::new();
        for template in standard_templates(config) {
            let name = template.name.clone();
            if let Err(e) = registry.register(with_side_channels(template)) {
                error!("Standard stage '{}' was not registered: {}", name, e);
            }
        }

        for pattern in [
            layout::RAW_FASTQC,
            layout::TRIMMED_FASTQC,
            layout::KRAKEN2_REPORT,
            layout::DEPTH,
            layout::CONSENSUS,
            layout::IVAR_VARIANTS,
            layout::LINEAGE_REPORT,
        ] {
            registry.add_target(pattern, Guard::Always);
        }
        registry.add_target(
            layout::FREEBAYES_VCF,
            Guard::Feature(Feature::VariantCalling),
        );
        registry.add_target(
            layout::FREEBAYES_CONSENSUS,
            Guard::Feature(Feature::VariantCalling),
        );
        registry.add_target(
            layout::BRESEQ_INDEX,
            Guard::Feature(Feature::MutationAnalysis),
        );

        registry
    }
}

/// Adds per-stage log and benchmark patterns, split per read when the
/// stage is per read.
fn with_side_channels(template: StageTemplate) -> StageTemplate {
    let per_read = template.wildcard_names().iter().any(|n| n == READ);
    let stem = if per_read {
        format!("{}_R{{read}}", template.name)
    } else {
        template.name.clone()
    };

    let log = format!("{}/{}.log", layout::LOG_DIR, stem);
    let benchmark = format!("{}/{}.tsv", layout::BENCHMARK_DIR, stem);
    template.log(log.as_str()).benchmark(benchmark.as_str())
}

fn path_str(path: &std::path::Path) -> String {
    path.display().to_string()
}

fn standard_templates(config: &RunConfig) -> Vec<StageTemplate> {
    let reference = path_str(&config.viral_reference_genome);
    let raw_r1 = layout::RAW_READS.replace("{read}", "1");
    let raw_r2 = layout::RAW_READS.replace("{read}", "2");

    let mut templates = vec![
        StageTemplate::raw("raw_reads_link", Action::LinkRaw)
            .output("reads", layout::RAW_READS)
            .guarded(Guard::RawInput(RawInputPolicy::DirectLink)),
        StageTemplate::raw("raw_reads_pool_sort", Action::PoolAndSort)
            .output("reads", layout::RAW_READS)
            .guarded(Guard::RawInput(RawInputPolicy::PoolAndSort)),
        StageTemplate::shell(
            "raw_fastqc",
            "fastqc",
            "fastqc -q -t {threads} -o $(dirname {output.html}) {input.reads} > {log} 2>&1",
        )
        .input("reads", layout::RAW_READS)
        .output("html", layout::RAW_FASTQC)
        .lenient(),
        StageTemplate::shell(
            "host_removal",
            "bwa",
            "bwa mem -t {threads} {params.composite_reference} {input.r1} {input.r2} 2> {log} \
             | samtools view -b -e '!(rname =~ \"^chr\")' - \
             | samtools sort -n -@ {threads} - \
             | samtools fastq -1 {output.r1} -2 {output.r2} -0 /dev/null -s /dev/null -n - 2>> {log}",
        )
        .input("r1", raw_r1.as_str())
        .input("r2", raw_r2.as_str())
        .output("r1", layout::HOST_REMOVED_R1)
        .output("r2", layout::HOST_REMOVED_R2)
        .param("composite_reference", path_str(&config.composite_reference))
        .threads(4),
        StageTemplate::shell(
            "adapter_trimming",
            "trim_galore",
            "trim_galore --quality {params.min_qual} --length {params.min_len} \
             -o $(dirname {output.r1}) --cores {threads} --paired {input.r1} {input.r2} 2> {log}",
        )
        .input("r1", layout::HOST_REMOVED_R1)
        .input("r2", layout::HOST_REMOVED_R2)
        .output("r1", layout::TRIMMED_R1)
        .output("r2", layout::TRIMMED_R2)
        .param("min_qual", config.min_qual)
        .param("min_len", config.min_len)
        .threads(2),
        StageTemplate::shell(
            "trimmed_fastqc",
            "fastqc",
            "fastqc -q -t {threads} -o $(dirname {output.html}) {input.reads} > {log} 2>&1",
        )
        .input("reads", layout::TRIMMED_READ)
        .output("html", layout::TRIMMED_FASTQC)
        .lenient(),
        StageTemplate::shell(
            "kraken2",
            "kraken2",
            "kraken2 --db {params.db} --threads {threads} --quick --output /dev/null \
             --report {output.report} --paired --gzip-compressed {input.r1} {input.r2} 2> {log}",
        )
        .input("r1", layout::TRIMMED_R1)
        .input("r2", layout::TRIMMED_R2)
        .output("report", layout::KRAKEN2_REPORT)
        .param("db", path_str(&config.kraken2_db))
        .threads(4)
        .lenient(),
        StageTemplate::shell(
            "viral_mapping",
            "bwa",
            "bwa mem -t {threads} {params.reference} {input.r1} {input.r2} 2> {log} \
             | samtools view -b -F 4 - \
             | samtools sort -@ {threads} -o {output.bam} - 2>> {log} \
             && samtools index {output.bam}",
        )
        .input("r1", layout::TRIMMED_R1)
        .input("r2", layout::TRIMMED_R2)
        .output("bam", layout::MAPPED_BAM)
        .param("reference", &reference)
        .threads(4),
        StageTemplate::shell(
            "primer_trimming",
            "ivar",
            "ivar trim -e -i {input.bam} -b {params.scheme_bed} -m {params.min_len} \
             -q {params.min_qual} -p $(dirname {output.bam})/{sample}.primertrimmed > {log} 2>&1 \
             && samtools sort -o {output.bam} $(dirname {output.bam})/{sample}.primertrimmed.bam \
             && samtools index {output.bam}",
        )
        .input("bam", layout::MAPPED_BAM)
        .output("bam", layout::PRIMER_TRIMMED_BAM)
        .param("scheme_bed", path_str(&config.scheme_bed))
        .param("min_len", config.min_len)
        .param("min_qual", config.min_qual),
        StageTemplate::shell(
            "coverage",
            "samtools",
            "samtools depth -a -d 0 {input.bam} > {output.depth} 2> {log}",
        )
        .input("bam", layout::PRIMER_TRIMMED_BAM)
        .output("depth", layout::DEPTH)
        .lenient(),
        StageTemplate::shell(
            "consensus",
            "ivar",
            "samtools mpileup -aa -A -d {params.mpileup_depth} -Q 0 {input.bam} 2> {log} \
             | ivar consensus -t {params.freq_threshold} -m {params.min_depth} -n N \
             -p $(dirname {output.fasta})/{sample}.consensus >> {log} 2>&1",
        )
        .input("bam", layout::PRIMER_TRIMMED_BAM)
        .output("fasta", layout::CONSENSUS)
        .param("mpileup_depth", config.mpileup_depth)
        .param("freq_threshold", config.ivar_freq_threshold)
        .param("min_depth", config.ivar_min_coverage_depth)
        .lenient(),
        StageTemplate::shell(
            "ivar_variants",
            "ivar",
            "samtools mpileup -aa -A -d 0 --reference {params.reference} -B -Q 0 {input.bam} 2> {log} \
             | ivar variants -r {params.reference} -g {params.gff} -m {params.min_depth} \
             -t {params.min_freq} -q {params.min_qual} \
             -p $(dirname {output.tsv})/{sample}.variants >> {log} 2>&1",
        )
        .input("bam", layout::PRIMER_TRIMMED_BAM)
        .output("tsv", layout::IVAR_VARIANTS)
        .param("reference", &reference)
        .param("gff", path_str(&config.viral_reference_feature_coords))
        .param("min_depth", config.ivar_min_coverage_depth)
        .param("min_freq", config.ivar_min_freq_threshold)
        .param("min_qual", config.ivar_min_variant_quality)
        .lenient(),
        StageTemplate::shell(
            "freebayes",
            "freebayes",
            "freebayes -f {params.reference} --pooled-continuous --min-coverage {params.min_depth} \
             {input.bam} 2> {log} \
             | bcftools norm -f {params.reference} -m -any -Ov -o {output.vcf} - 2>> {log} \
             && bgzip -f -k {output.vcf} && bcftools index -f {output.vcf}.gz \
             && bcftools consensus -f {params.reference} {output.vcf}.gz > {output.consensus} 2>> {log}",
        )
        .input("bam", layout::PRIMER_TRIMMED_BAM)
        .output("vcf", layout::FREEBAYES_VCF)
        .output("consensus", layout::FREEBAYES_CONSENSUS)
        .param("reference", &reference)
        .param("min_depth", config.ivar_min_coverage_depth)
        .guarded(Guard::Feature(Feature::VariantCalling))
        .lenient(),
        StageTemplate::shell(
            "lineage",
            "pangolin",
            "pangolin --outdir $(dirname {output.report}) --outfile $(basename {output.report}) \
             --threads {threads} {input.consensus} > {log} 2>&1",
        )
        .input("consensus", layout::CONSENSUS)
        .output("report", layout::LINEAGE_REPORT)
        .threads(2)
        .lenient(),
    ];

    let breseq = StageTemplate::shell(
        "breseq",
        "breseq",
        "breseq --reference {params.reference} --num-processors {threads} \
         --polymorphism-prediction --brief-html-output \
         --output $(dirname $(dirname {output.html})) {input.r1} {input.r2} > {log} 2>&1",
    )
    .input("r1", layout::TRIMMED_R1)
    .input("r2", layout::TRIMMED_R2)
    .output("html", layout::BRESEQ_INDEX)
    .threads(4)
    .guarded(Guard::Feature(Feature::MutationAnalysis))
    .lenient();

    // the reference is only checked when the module is enabled
    let breseq = match config.breseq_reference.as_ref() {
        Some(path) => breseq.param("reference", path_str(path)),
        None => breseq,
    };
    templates.push(breseq);

    templates
}
