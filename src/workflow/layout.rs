//! On-disk output layout, relative to the result directory.
//!
//! One directory per sample with numbered stage folders. The same patterns
//! drive the stage registry and the postprocessing scan.

pub const RAW_READS: &str = "{sample}/00_raw/{sample}_R{read}.fastq.gz";
pub const RAW_FASTQC: &str = "{sample}/01_fastqc_raw/{sample}_R{read}_fastqc.html";
pub const HOST_REMOVED_R1: &str = "{sample}/02_host_removal/{sample}_R1.fastq.gz";
pub const HOST_REMOVED_R2: &str = "{sample}/02_host_removal/{sample}_R2.fastq.gz";
pub const TRIMMED_R1: &str = "{sample}/03_trimmed/{sample}_R1_val_1.fq.gz";
pub const TRIMMED_R2: &str = "{sample}/03_trimmed/{sample}_R2_val_2.fq.gz";
pub const TRIMMED_READ: &str = "{sample}/03_trimmed/{sample}_R{read}_val_{read}.fq.gz";
pub const TRIMMED_FASTQC: &str =
    "{sample}/04_fastqc_trimmed/{sample}_R{read}_val_{read}_fastqc.html";
pub const KRAKEN2_REPORT: &str = "{sample}/05_kraken2/{sample}_kraken2.report";
pub const MAPPED_BAM: &str = "{sample}/06_mapping/{sample}.sorted.bam";
pub const PRIMER_TRIMMED_BAM: &str = "{sample}/07_primer_trimmed/{sample}.primertrimmed.sorted.bam";
pub const DEPTH: &str = "{sample}/08_coverage/{sample}_depth.txt";
pub const CONSENSUS: &str = "{sample}/09_consensus/{sample}.consensus.fa";
pub const IVAR_VARIANTS: &str = "{sample}/10_variants/{sample}.variants.tsv";
pub const FREEBAYES_VCF: &str = "{sample}/11_freebayes/{sample}.variants.norm.vcf";
pub const FREEBAYES_CONSENSUS: &str = "{sample}/11_freebayes/{sample}.consensus.fasta";
pub const LINEAGE_REPORT: &str = "{sample}/12_lineage/{sample}_lineage_report.csv";
pub const BRESEQ_INDEX: &str = "{sample}/13_breseq/output/index.html";

pub const LOG_DIR: &str = "{sample}/logs";
pub const BENCHMARK_DIR: &str = "{sample}/benchmarks";

/// Consolidated per-sample report written by postprocessing.
pub const SUMMARY_REPORT: &str = "summary.tsv";

/// Tool and database version manifest written by postprocessing.
pub const VERSION_MANIFEST: &str = "versions.json";

/// Run ledger, relative to the result directory.
pub const RUN_STATE: &str = ".ampliflow/run_state.json";

/// Substitutes the sample wildcard of a per-sample pattern.
pub fn for_sample(pattern: &str, sample: &str) -> String {
    pattern.replace("{sample}", sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_sample() {
        assert_eq!(for_sample(DEPTH, "S1"), "S1/08_coverage/S1_depth.txt");
    }

    #[test]
    fn test_stage_folders_are_numbered_in_order() {
        let folders: Vec<&str> = [
            RAW_READS,
            RAW_FASTQC,
            HOST_REMOVED_R1,
            TRIMMED_R1,
            TRIMMED_FASTQC,
            KRAKEN2_REPORT,
            MAPPED_BAM,
            PRIMER_TRIMMED_BAM,
            DEPTH,
            CONSENSUS,
            IVAR_VARIANTS,
            FREEBAYES_VCF,
            LINEAGE_REPORT,
            BRESEQ_INDEX,
        ]
        .iter()
        .map(|p| p.split('/').nth(1).unwrap())
        .collect();

        let mut sorted = folders.clone();
        sorted.sort();
        assert_eq!(folders, sorted);
    }
}
