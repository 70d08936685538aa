//! Stage templates and the external tool exit-code contract.
//!
//! A stage is one external process. Its arguments are templates rendered
//! against run-wide values (thresholds, builds, reference paths) and
//! per-invocation values (input, output, threads, scratch directory).

use crate::config::{ArtifactLayout, FilterConfig, ResourceClass, StageCondition, StageSpec};
use crate::io::Table;
use crate::context::RunContext;
use crate::error::FailureKind;
use crate::reference::ReferencePaths;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitStatus;

/// Exit codes of processes killed by SIGKILL (137) or SIGTERM (143).
pub const OOM_EXIT_CODES: [i32; 2] = [137, 143];

/// Exit code recorded for a stage killed after its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 137;

/// Placeholders filled per invocation by the stage runner.
pub const INVOCATION_PLACEHOLDERS: [&str; 6] =
    ["input", "output", "threads", "chunk", "workdir", "source"];

/// Run-wide template values.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: BTreeMap<String, Option<String>>,
}

impl TemplateVars {
    /// Values shared by every stage invocation of a run.
    pub fn for_run(
        ctx: &RunContext,
        filters: &FilterConfig,
        reference: &ReferencePaths,
        layout: &ArtifactLayout,
    ) -> Self {
        let mut vars = Self::default();
        let path = |p: &Path| Some(p.to_string_lossy().to_string());

        vars.set("quality", Some(filters.quality.to_string()));
        vars.set("min_ac", Some(filters.min_allele_count.to_string()));
        vars.set("max_missing", Some(filters.max_missingness.to_string()));
        vars.set("source_build", Some(ctx.source_build.to_string()));
        vars.set("target_build", Some(ctx.target_build.to_string()));
        vars.set("reference_fasta", path(&reference.fasta));
        vars.set(
            "source_fasta",
            reference.liftover.as_ref().and_then(|l| path(&l.source_fasta)),
        );
        vars.set("chain", reference.liftover.as_ref().and_then(|l| path(&l.chain)));
        vars.set("records_ext", Some(layout.extension(Table::Records).to_string()));
        vars.set("samples_ext", Some(layout.extension(Table::Samples).to_string()));
        vars.set("metadata_ext", Some(layout.extension(Table::Metadata).to_string()));
        for name in INVOCATION_PLACEHOLDERS {
            vars.set(name, None);
        }
        vars
    }

    pub fn set(&mut self, name: &str, value: Option<String>) {
        self.values.insert(name.to_string(), value);
    }

    /// Copy with per-invocation values filled in.
    pub fn with_invocation(&self, values: &[(&str, String)]) -> Self {
        let mut vars = self.clone();
        for (name, value) in values {
            vars.set(name, Some(value.clone()));
        }
        vars
    }

    /// Substitute every `{name}` placeholder.
    ///
    /// Braces that do not enclose a lowercase identifier are copied through.
    /// A known placeholder without a value, or an unknown one, is an error.
    pub fn render(&self, template: &str) -> Result<String, String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}');
            let name = close.map(|c| &after[..c]);

            match name {
                Some(name) if is_placeholder(name) => {
                    match self.values.get(name) {
                        Some(Some(value)) => out.push_str(value),
                        Some(None) => return Err(format!("placeholder {{{}}} has no value", name)),
                        None => return Err(format!("unknown placeholder {{{}}}", name)),
                    }
                    rest = &after[name.len() + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Render with invocation placeholders stubbed, to catch template errors early.
    pub fn check(&self, template: &str) -> Result<(), String> {
        let stub: Vec<(&str, String)> = INVOCATION_PLACEHOLDERS
            .iter()
            .map(|n| (*n, String::from("x")))
            .collect();
        self.with_invocation(&stub).render(template).map(|_| ())
    }
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_')
}

/// The ordered stages that actually run for this build combination.
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<StageSpec>,
}

impl StagePlan {
    /// Drop stages whose condition does not hold.
    pub fn resolve(specs: &[StageSpec], liftover: bool) -> Self {
        let stages = specs
            .iter()
            .filter(|s| match s.when {
                StageCondition::Always => true,
                StageCondition::Liftover => liftover,
            })
            .cloned()
            .collect();
        Self { stages }
    }

    /// Same stages, every one forced into `class`.
    pub fn with_class(&self, class: ResourceClass) -> Self {
        Self {
            stages: self
                .stages
                .iter()
                .cloned()
                .map(|mut s| {
                    s.resource_class = class;
                    s
                })
                .collect(),
        }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Verify every template renders with the run-wide values.
    pub fn check(&self, vars: &TemplateVars) -> anyhow::Result<()> {
        if self.stages.is_empty() {
            anyhow::bail!("No stage applies to this build combination");
        }
        for stage in &self.stages {
            for template in stage.args.iter().chain(std::iter::once(&stage.output)) {
                vars.check(template)
                    .map_err(|e| anyhow::anyhow!("Stage '{}': {}", stage.name, e))?;
            }
        }
        Ok(())
    }
}

/// Classify a stage exit code.
pub fn classify_code(stage: &str, code: i32) -> Result<(), FailureKind> {
    if code == 0 {
        Ok(())
    } else if OOM_EXIT_CODES.contains(&code) {
        Err(FailureKind::Killed {
            stage: stage.to_string(),
            exit_code: code,
        })
    } else {
        Err(FailureKind::ExitCode {
            stage: stage.to_string(),
            exit_code: code,
        })
    }
}

/// Exit code of a finished process, mapping death by signal to `128 + signal`.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    None
}

/// Classify a finished process.
pub fn classify_exit(stage: &str, status: &ExitStatus) -> Result<(), FailureKind> {
    match exit_code(status) {
        Some(code) => classify_code(stage, code),
        None => Err(FailureKind::Abnormal {
            stage: stage.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_prune_stages, default_stages, Config};
    use crate::reference::LiftoverPaths;
    use std::path::PathBuf;

    fn vars(liftover: bool) -> TemplateVars {
        vars_with_layout(liftover, &ArtifactLayout::default())
    }

    fn vars_with_layout(liftover: bool, layout: &ArtifactLayout) -> TemplateVars {
        let config = Config::from_yaml(crate::config::tests::MINIMAL_YAML).unwrap();
        let ctx = RunContext::from_config(&config).unwrap();
        let reference = ReferencePaths {
            fasta: PathBuf::from("/ref/GRCh38.fa"),
            fasta_index: PathBuf::from("/ref/GRCh38.fa.fai"),
            liftover: liftover.then(|| LiftoverPaths {
                source_fasta: PathBuf::from("/ref/hg19.fa"),
                source_fasta_index: PathBuf::from("/ref/hg19.fa.fai"),
                chain: PathBuf::from("/ref/hg19ToHg38.chain"),
            }),
        };
        TemplateVars::for_run(&ctx, &config.filters, &reference, layout)
    }

    #[test]
    fn test_render_placeholders() {
        let v = vars(false).with_invocation(&[
            ("input", "/w/in.vcf.gz".to_string()),
            ("threads", "4".to_string()),
        ]);
        assert_eq!(v.render("INFO/R2>{quality}").unwrap(), "INFO/R2>0.3");
        assert_eq!(
            v.render("--threads={threads} {input}").unwrap(),
            "--threads=4 /w/in.vcf.gz"
        );
        assert_eq!(v.render("{reference_fasta}").unwrap(), "/ref/GRCh38.fa");
    }

    #[test]
    fn test_render_passes_non_placeholder_braces() {
        let v = vars(false);
        assert_eq!(v.render("awk '{print $1}'").unwrap(), "awk '{print $1}'");
        assert_eq!(v.render("{").unwrap(), "{");
        assert_eq!(v.render("{}").unwrap(), "{}");
    }

    #[test]
    fn test_render_errors() {
        let v = vars(false);
        assert!(v.render("{chain}").unwrap_err().contains("no value"));
        assert!(v.render("{bogus}").unwrap_err().contains("unknown"));
        assert!(v.render("{input}").is_err(), "invocation values are unset");
    }

    #[test]
    fn test_plan_skips_liftover_when_builds_match() {
        let plan = StagePlan::resolve(&default_stages(), false);
        assert_eq!(plan.stages().len(), 8);
        assert!(plan.stages().iter().all(|s| s.name != "liftover"));
        assert!(plan.check(&vars(false)).is_ok());

        let plan = StagePlan::resolve(&default_stages(), true);
        assert_eq!(plan.stages()[1].name, "liftover");
        assert!(plan.check(&vars(true)).is_ok());
        assert!(plan.check(&vars(false)).is_err(), "liftover needs chain");
    }

    #[test]
    fn test_prune_stages_follow_records_extension() {
        let layout = ArtifactLayout {
            records: "txt".to_string(),
            ..ArtifactLayout::default()
        };
        let v = vars_with_layout(false, &layout).with_invocation(&[
            ("source", "/cache/chr1/chr1".to_string()),
            ("input", "/w/chr1.ld".to_string()),
            ("output", "/w/chr1.out".to_string()),
            ("threads", "2".to_string()),
        ]);

        let plan = StagePlan::resolve(&default_prune_stages(), false);
        assert!(plan.check(&v).is_ok());
        for stage in plan.stages() {
            let args = stage
                .args
                .iter()
                .map(|a| v.render(a).unwrap())
                .collect::<Vec<_>>();
            assert!(args.contains(&"/cache/chr1/chr1.txt".to_string()), "{:?}", args);
            assert!(!args.iter().any(|a| a.ends_with(".vcf") && a.starts_with("/cache")));
        }
    }

    #[test]
    fn test_with_class_overrides_every_stage() {
        let plan = StagePlan::resolve(&default_stages(), false).with_class(ResourceClass::Heavy);
        assert!(plan
            .stages()
            .iter()
            .all(|s| s.resource_class == ResourceClass::Heavy));
    }

    #[test]
    fn test_exit_code_contract() {
        assert!(classify_code("s", 0).is_ok());
        assert!(matches!(
            classify_code("s", 137),
            Err(FailureKind::Killed { exit_code: 137, .. })
        ));
        assert!(matches!(
            classify_code("s", 143),
            Err(FailureKind::Killed { exit_code: 143, .. })
        ));
        assert!(matches!(
            classify_code("s", 1),
            Err(FailureKind::ExitCode { exit_code: 1, .. })
        ));
        assert!(matches!(
            classify_code("s", 139),
            Err(FailureKind::ExitCode { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_maps_to_128_plus() {
        use std::os::unix::process::ExitStatusExt;
        let killed = ExitStatus::from_raw(9);
        assert_eq!(exit_code(&killed), Some(137));
        assert!(matches!(
            classify_exit("s", &killed),
            Err(FailureKind::Killed { exit_code: 137, .. })
        ));
        let ok = ExitStatus::from_raw(0);
        assert!(classify_exit("s", &ok).is_ok());
    }
}
