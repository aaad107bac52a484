/// Merge jobs and merge plans
///
/// A merge job applies one character adapter followed by the shared common
/// adapters onto a pristine copy of the base. A merge plan runs one job per
/// named variant and writes one weight file per variant.

use crate::dtype::OutputPrecision;
use crate::finalize::Finalizer;
use crate::keys::{KeyResolver, NamingConvention};
use crate::merge::{Accumulator, AdapterReport, PairOutcome};
use crate::store::WeightStore;
use crate::{Error, Result, WeightSet};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

fn default_strength() -> f64 {
    1.0
}

fn default_template() -> String {
    "{name}_merged.safetensors".to_string()
}

/// One adapter file and the strength it is applied with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub path: PathBuf,
    #[serde(default = "default_strength")]
    pub strength: f64,
}

impl AdapterSpec {
    pub fn new(path: impl Into<PathBuf>, strength: f64) -> Self {
        Self {
            path: path.into(),
            strength,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.strength.is_finite() || self.strength < 0.0 {
            return Err(Error::Config(format!(
                "strength for {} must be a nonnegative number, got {}",
                self.path.display(),
                self.strength
            )));
        }
        Ok(())
    }
}

impl std::str::FromStr for AdapterSpec {
    type Err = String;

    /// `path` or `path:strength`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((path, strength)) if !path.is_empty() => {
                match strength.parse::<f64>() {
                    Ok(strength) => Ok(Self::new(path, strength)),
                    // a colon that is part of the path itself
                    Err(_) => Ok(Self::new(s, default_strength())),
                }
            }
            _ => Ok(Self::new(s, default_strength())),
        }
    }
}

/// One output of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub adapter: AdapterSpec,
}

/// A full merge run, usually read from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePlan {
    /// Base checkpoint every variant starts from
    pub base: PathBuf,
    pub output_dir: PathBuf,
    /// File name per variant; `{name}` is replaced with the variant name
    #[serde(default = "default_template")]
    pub output_template: String,
    #[serde(default)]
    pub precision: OutputPrecision,
    #[serde(default)]
    pub naming: NamingConvention,
    /// Applied after the character adapter, in this order
    #[serde(default)]
    pub common: Vec<AdapterSpec>,
    pub variants: Vec<Variant>,
}

impl MergePlan {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let plan: MergePlan = serde_yaml::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            return Err(Error::Config("plan has no variants".into()));
        }
        if !self.output_template.contains("{name}") {
            return Err(Error::Config(format!(
                "output_template '{}' must contain {{name}}",
                self.output_template
            )));
        }

        let mut names = HashSet::new();
        for variant in &self.variants {
            if variant.name.is_empty() {
                return Err(Error::Config("variant name must not be empty".into()));
            }
            // The name becomes part of a file name inside output_dir
            if variant.name.contains(['/', '\\']) || variant.name.contains("..") {
                return Err(Error::Config(format!(
                    "variant name '{}' must not contain path separators or '..'",
                    variant.name
                )));
            }
            if !names.insert(variant.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate variant name '{}'",
                    variant.name
                )));
            }
            variant.adapter.validate()?;
        }
        for spec in &self.common {
            spec.validate()?;
        }
        Ok(())
    }

    pub fn output_path(&self, variant: &str) -> PathBuf {
        self.output_dir
            .join(self.output_template.replace("{name}", variant))
    }
}

/// Per-adapter line of a merge summary
#[derive(Debug, Clone)]
pub struct AdapterApplication {
    pub spec: AdapterSpec,
    /// `false` when the file was absent and the adapter was skipped
    pub found: bool,
    pub report: AdapterReport,
}

impl AdapterApplication {
    pub fn applied(&self) -> usize {
        self.report.applied()
    }
}

/// Merged weights plus what each adapter contributed
#[derive(Debug)]
pub struct MergeOutcome {
    pub weights: WeightSet,
    pub applications: Vec<AdapterApplication>,
}

/// Runs merge jobs against a store
pub struct MergeRunner<'s, S: WeightStore> {
    store: &'s S,
    accumulator: Accumulator,
    progress: bool,
}

impl<'s, S: WeightStore> MergeRunner<'s, S> {
    pub fn new(store: &'s S, accumulator: Accumulator) -> Self {
        Self {
            store,
            accumulator,
            progress: false,
        }
    }

    /// Show a progress bar per adapter
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Merge the character adapter, then `common` in order, into a copy of `base`
    ///
    /// Missing adapter files are skipped with a warning. Any other load
    /// failure aborts the job.
    pub fn merge(
        &self,
        base: &WeightSet,
        common: &[AdapterSpec],
        character: &AdapterSpec,
    ) -> Result<MergeOutcome> {
        let mut weights = base.clone();
        let mut applications = Vec::with_capacity(common.len() + 1);

        for spec in std::iter::once(character).chain(common) {
            let (next, application) = self.apply_spec(weights, spec)?;
            weights = next;
            applications.push(application);
        }

        Ok(MergeOutcome {
            weights,
            applications,
        })
    }

    fn apply_spec(
        &self,
        weights: WeightSet,
        spec: &AdapterSpec,
    ) -> Result<(WeightSet, AdapterApplication)> {
        if !self.store.exists(&spec.path) {
            warn!(path = %spec.path.display(), "LoRA not found, skipping");
            return Ok((
                weights,
                AdapterApplication {
                    spec: spec.clone(),
                    found: false,
                    report: AdapterReport::default(),
                },
            ));
        }

        info!(
            path = %spec.path.display(),
            strength = spec.strength,
            "Applying LoRA"
        );
        // Dropped at the end of this call, before the next adapter loads
        let adapter = self.store.load(&spec.path)?;

        let bar = self.progress_bar(crate::adapter::group_ids(&adapter).len());
        let (next, report) = self.accumulator.apply_adapter_observed(
            &weights,
            &adapter,
            spec.strength,
            |outcome: &PairOutcome| {
                bar.set_message(outcome.group().to_string());
                bar.inc(1);
            },
        );
        bar.finish_and_clear();

        Ok((
            next,
            AdapterApplication {
                spec: spec.clone(),
                found: true,
                report,
            },
        ))
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("  {bar:40.cyan/blue} {pos}/{len} {wide_msg}")
        {
            bar.set_style(style);
        }
        bar
    }
}

/// Options that do not belong in the plan file
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub progress: bool,
}

#[derive(Debug, Clone)]
pub struct ProducedVariant {
    pub name: String,
    pub path: PathBuf,
    pub applications: Vec<AdapterApplication>,
}

#[derive(Debug, Clone)]
pub struct FailedVariant {
    pub name: String,
    pub error: String,
}

/// What a plan run produced
#[derive(Debug, Clone, Default)]
pub struct PlanSummary {
    pub produced: Vec<ProducedVariant>,
    pub failed: Vec<FailedVariant>,
}

impl PlanSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Run every variant of `plan`
///
/// A missing base aborts the whole run. Failures inside one variant are
/// recorded in the summary and the remaining variants still run.
pub fn run_plan<S: WeightStore>(
    plan: &MergePlan,
    store: &S,
    options: RunOptions,
) -> Result<PlanSummary> {
    plan.validate()?;

    if !store.exists(&plan.base) {
        return Err(Error::BaseNotFound {
            path: plan.base.clone(),
        });
    }

    info!(path = %plan.base.display(), "Loading base model");
    let base = store.load(&plan.base)?;
    info!(tensors = base.len(), "Loaded base weights");

    std::fs::create_dir_all(&plan.output_dir)?;

    let accumulator = Accumulator::new(KeyResolver::new(plan.naming.clone()));
    let runner = MergeRunner::new(store, accumulator).with_progress(options.progress);
    let finalizer = Finalizer::new(plan.precision);

    let mut summary = PlanSummary::default();
    for variant in &plan.variants {
        info!(variant = %variant.name, "Creating merged model");
        let output = plan.output_path(&variant.name);

        match run_variant(&runner, &finalizer, &base, plan, variant, &output) {
            Ok(applications) => {
                match std::fs::metadata(&output) {
                    Ok(meta) => info!(
                        variant = %variant.name,
                        path = %output.display(),
                        size_gb = meta.len() as f64 / (1024.0 * 1024.0 * 1024.0),
                        "Saved merged model"
                    ),
                    Err(_) => info!(
                        variant = %variant.name,
                        path = %output.display(),
                        "Saved merged model"
                    ),
                }
                summary.produced.push(ProducedVariant {
                    name: variant.name.clone(),
                    path: output,
                    applications,
                });
            }
            Err(err) => {
                error!(variant = %variant.name, error = %err, "Merge failed");
                summary.failed.push(FailedVariant {
                    name: variant.name.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    Ok(summary)
}

fn run_variant<S: WeightStore>(
    runner: &MergeRunner<'_, S>,
    finalizer: &Finalizer,
    base: &WeightSet,
    plan: &MergePlan,
    variant: &Variant,
    output: &Path,
) -> Result<Vec<AdapterApplication>> {
    let outcome = runner.merge(base, &plan.common, &variant.adapter)?;
    let merged = finalizer.finalize(outcome.weights)?;

    info!(path = %output.display(), "Saving merged model");
    runner.store.save(&merged, output)?;
    Ok(outcome.applications)
}
