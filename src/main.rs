//! lora-bake CLI - bake LoRA adapters into base checkpoints
//!
//! Usage:
//!   lora-bake run plan.yaml
//!   lora-bake merge --base base.safetensors --adapter ava.safetensors:1.0 \
//!       --adapter lightning.safetensors --output ava_merged.safetensors
//!   lora-bake inspect --adapter ava.safetensors --base base.safetensors \
//!       --namespace diffusion_model.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use lora_bake::adapter::{self, Extracted};
use lora_bake::job::{AdapterSpec, MergeRunner, RunOptions};
use lora_bake::{
    run_plan, Accumulator, Finalizer, KeyResolver, MergePlan, NamingConvention, OutputPrecision,
    SafetensorsStore, WeightStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "lora-bake",
    about = "Bake LoRA adapters permanently into base checkpoints",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every variant of a merge plan
    Run {
        /// Path to the plan (YAML)
        plan: PathBuf,

        /// Disable progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Merge adapters into one base checkpoint
    Merge {
        /// Base checkpoint (.safetensors)
        #[arg(long)]
        base: PathBuf,

        /// Adapter as path[:strength], applied in the order given
        #[arg(long = "adapter", required = true)]
        adapters: Vec<AdapterSpec>,

        /// Output file
        #[arg(long)]
        output: PathBuf,

        /// Output precision: bf16, f16, f32
        #[arg(long, default_value = "bf16")]
        precision: OutputPrecision,

        /// Disable progress bars
        #[arg(long)]
        no_progress: bool,

        #[command(flatten)]
        naming: NamingArgs,
    },

    /// List an adapter's pairs and where they would land
    Inspect {
        /// Adapter file (.safetensors)
        #[arg(long)]
        adapter: PathBuf,

        /// Base checkpoint to resolve targets against
        #[arg(long)]
        base: Option<PathBuf>,

        #[command(flatten)]
        naming: NamingArgs,
    },
}

/// Key naming overrides; plans set these under `naming:`
#[derive(Args)]
struct NamingArgs {
    /// Namespace the base nests its parameters under
    #[arg(long)]
    namespace: Option<String>,

    /// Adapter prefix stripped before matching (repeatable)
    #[arg(long = "strip-prefix")]
    strip_prefixes: Vec<String>,
}

impl NamingArgs {
    fn resolver(self) -> KeyResolver {
        let mut naming = NamingConvention::default();
        if let Some(namespace) = self.namespace {
            naming.namespace = namespace;
        }
        if !self.strip_prefixes.is_empty() {
            naming.strip_prefixes = self.strip_prefixes;
        }
        KeyResolver::new(naming)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lora_bake=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { plan, no_progress } => run(plan, !no_progress),
        Commands::Merge {
            base,
            adapters,
            output,
            precision,
            no_progress,
            naming,
        } => merge(base, adapters, output, precision, !no_progress, naming.resolver()),
        Commands::Inspect {
            adapter,
            base,
            naming,
        } => inspect(adapter, base, naming.resolver()),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn run(plan_path: PathBuf, progress: bool) -> Result<ExitCode> {
    let plan = MergePlan::from_file(&plan_path)
        .with_context(|| format!("Failed to read plan {}", plan_path.display()))?;
    let store = SafetensorsStore::default();

    let summary = run_plan(&plan, &store, RunOptions { progress })?;

    println!("\nCreated merged models:");
    for produced in &summary.produced {
        println!("  - {}: {}", produced.name, produced.path.display());
        for app in &produced.applications {
            let status = if app.found { "" } else { " (not found)" };
            println!(
                "      {} x{}: {} pairs applied{}",
                app.spec.path.display(),
                app.spec.strength,
                app.applied(),
                status
            );
        }
    }
    if !summary.failed.is_empty() {
        println!("\nFailed variants:");
        for failed in &summary.failed {
            println!("  - {}: {}", failed.name, failed.error);
        }
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn merge(
    base_path: PathBuf,
    adapters: Vec<AdapterSpec>,
    output: PathBuf,
    precision: OutputPrecision,
    progress: bool,
    resolver: KeyResolver,
) -> Result<ExitCode> {
    for spec in &adapters {
        spec.validate()?;
    }
    let Some((character, common)) = adapters.split_first() else {
        bail!("at least one --adapter is required");
    };

    let store = SafetensorsStore::default();
    if !store.exists(&base_path) {
        bail!("Base model not found at {}", base_path.display());
    }
    let base = store.load(&base_path)?;

    let runner = MergeRunner::new(&store, Accumulator::new(resolver)).with_progress(progress);
    let outcome = runner.merge(&base, common, character)?;
    for app in &outcome.applications {
        println!(
            "{} x{}: {} pairs applied",
            app.spec.path.display(),
            app.spec.strength,
            app.applied()
        );
    }

    let merged = Finalizer::new(precision).finalize(outcome.weights)?;
    store
        .save(&merged, &output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Saved {}", output.display());
    Ok(ExitCode::SUCCESS)
}

fn inspect(
    adapter_path: PathBuf,
    base_path: Option<PathBuf>,
    resolver: KeyResolver,
) -> Result<ExitCode> {
    let store = SafetensorsStore::default();
    let adapter_set = store.load(&adapter_path)?;
    let base = base_path.map(|p| store.load(&p)).transpose()?;

    let groups = adapter::group_ids(&adapter_set);
    println!("{} pair groups in {}", groups.len(), adapter_path.display());

    for group in &groups {
        let line = match adapter::extract_pair(&adapter_set, group) {
            Ok(Extracted::Pair(pair)) => format!(
                "{} rank={} alpha={} down={:?} up={:?}",
                pair.convention,
                pair.rank(),
                pair.alpha(),
                pair.down.dims(),
                pair.up.dims()
            ),
            Ok(Extracted::MissingUp { convention }) => format!("{} missing up factor", convention),
            Ok(Extracted::MissingDown) => "missing down factor".to_string(),
            Err(err) => format!("error: {}", err),
        };

        let target = match &base {
            Some(base) => match resolver.resolve(group, base) {
                Some(resolved) => format!(" -> {} {:?}", resolved.key, base[&resolved.key].dims()),
                None => " -> unresolved".to_string(),
            },
            None => String::new(),
        };
        println!("  {}: {}{}", group, line, target);
    }
    Ok(ExitCode::SUCCESS)
}
