use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use toml::Value;
use tracing_subscriber::EnvFilter;

use sky1_kernel_builder::config::{self, ConfigDoc};
use sky1_kernel_builder::executor::{ExecCtx, StdoutSink, builtin_registry, execute_plan};
use sky1_kernel_builder::stages::{plan_for, plan_stage};
use sky1_kernel_builder::workspace::{WorkspaceConfig, load_paths};
use sky1_kernel_builder::{Error, Result, tracks};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Log diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load config and print the computed task plan
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
        /// Only show the tasks of one stage
        #[arg(long)]
        stage: Option<String>,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
    },
    /// Run the whole pipeline: prepare, build, package, publish
    Run {
        build: PathBuf,
        #[arg(long)]
        dry_run: bool,
        /// Do not pause after non-fatal warnings
        #[arg(long, short)]
        yes: bool,
    },
    /// Fetch the kernel source and apply the variant's patch set
    Prepare {
        build: PathBuf,
        /// Kernel version, e.g. 6.18.9 or 6.19-rc7
        version: Option<String>,
        variant: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Configure and build packages from a prepared source tree
    Build {
        build: PathBuf,
        version: Option<String>,
        revision: Option<u32>,
        variant: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, short)]
        yes: bool,
    },
    /// Compile-test the prepared tree against stock config targets
    BuildTest {
        build: PathBuf,
        /// allyesconfig, allmodconfig, defconfig, randconfig or all
        #[arg(default_value = "allyesconfig")]
        target: String,
        variant: Option<String>,
        /// Build with W=1
        #[arg(long, short = 'W')]
        warnings: bool,
        #[arg(long)]
        modules_only: bool,
        /// How often to generate and build randconfig
        #[arg(long, short = 'n', default_value_t = 1)]
        repeat: u32,
        #[arg(long)]
        dry_run: bool,
    },
    /// Post-process collected packages and build the metapackages
    Package {
        build: PathBuf,
        variant: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Publish packages to the APT repository
    Publish {
        build: PathBuf,
        variant: Option<String>,
        /// Only publish packages of this kernel version (e.g. 6.18)
        version_filter: Option<String>,
        /// Publish exactly these files instead of the collected ones
        #[arg(long, num_args = 1..)]
        files: Vec<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, short)]
        yes: bool,
    },
    /// Inspect and edit the variant kernel configs and the config policy
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Show an option's value in every track and in the policy
    Show { build: PathBuf, option: String },
    /// Set OPTION=VALUE in every track that has the option
    Set {
        build: PathBuf,
        assignment: String,
        /// Also record the value in the policy under this section
        #[arg(long, value_name = "SECTION")]
        policy: Option<String>,
        #[arg(long)]
        apply: bool,
    },
    /// Remove an option from the policy (configs are left alone)
    Remove {
        build: PathBuf,
        option: String,
        #[arg(long)]
        apply: bool,
    },
    /// Check tracks against the policy and compare Sky1 options across them
    Reconcile {
        build: PathBuf,
        /// Rewrite values that violate the policy
        #[arg(long)]
        fix: bool,
        #[arg(long)]
        apply: bool,
        #[arg(long, short)]
        verbose: bool,
    },
    /// Review what changed between two kernel configs
    Review { old: PathBuf, new: PathBuf },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    match args.cmd {
        Command::Plan { build, dot, stage } => cmd_plan(&build, dot, stage.as_deref()),
        Command::Resolve { build } => cmd_resolve(&build),
        Command::Run {
            build,
            dry_run,
            yes,
        } => {
            let doc = config::load(&build)?;
            run_pipeline(&doc, None, dry_run, yes)
        }
        Command::Prepare {
            build,
            version,
            variant,
            dry_run,
        } => {
            let doc = load_with(&build, |doc| {
                set_str(doc, "build.kernel_version", version)?;
                set_str(doc, "build.variant", variant)
            })?;
            run_pipeline(&doc, Some("source"), dry_run, false)
        }
        Command::Build {
            build,
            version,
            revision,
            variant,
            dry_run,
            yes,
        } => {
            let doc = load_with(&build, |doc| {
                set_str(doc, "build.kernel_version", version)?;
                if let Some(r) = revision {
                    doc.set_path("build.revision", Value::Integer(i64::from(r)))?;
                }
                set_str(doc, "build.variant", variant)
            })?;
            run_pipeline(&doc, Some("build"), dry_run, yes)
        }
        Command::BuildTest {
            build,
            target,
            variant,
            warnings,
            modules_only,
            repeat,
            dry_run,
        } => {
            let doc = load_with(&build, |doc| {
                set_str(doc, "build.variant", variant)?;
                for step in ["configure", "compile", "collect"] {
                    doc.set_path(&format!("build.steps.{step}.enabled"), Value::Boolean(false))?;
                }
                doc.set_path("build.steps.smoke.enabled", Value::Boolean(true))?;
                doc.set_path(
                    "build.steps.smoke.targets",
                    Value::Array(vec![Value::String(target)]),
                )?;
                doc.set_path("build.steps.smoke.repeat", Value::Integer(i64::from(repeat)))?;
                doc.set_path("build.steps.smoke.warnings", Value::Boolean(warnings))?;
                doc.set_path("build.steps.smoke.modules_only", Value::Boolean(modules_only))
            })?;
            run_pipeline(&doc, Some("build"), dry_run, false)
        }
        Command::Package {
            build,
            variant,
            dry_run,
        } => {
            let doc = load_with(&build, |doc| set_str(doc, "build.variant", variant))?;
            run_pipeline(&doc, Some("package"), dry_run, false)
        }
        Command::Publish {
            build,
            variant,
            version_filter,
            files,
            dry_run,
            yes,
        } => {
            let doc = load_with(&build, |doc| {
                set_str(doc, "build.variant", variant)?;
                set_str(doc, "build.version_filter", version_filter)?;
                if !files.is_empty() {
                    let mut list = Vec::with_capacity(files.len());
                    for f in &files {
                        let abs = std::path::absolute(f).map_err(|e| {
                            Error::msg(format!("invalid path {}: {e}", f.display()))
                        })?;
                        list.push(Value::String(abs.to_string_lossy().into_owned()));
                    }
                    doc.set_path("publish.files", Value::Array(list))?;
                }
                Ok(())
            })?;
            run_pipeline(&doc, Some("publish"), dry_run, yes)
        }
        Command::Config { cmd } => cmd_config(cmd),
    }
}

fn load_with(path: &Path, f: impl FnOnce(&mut ConfigDoc) -> Result<()>) -> Result<ConfigDoc> {
    let mut doc = config::load(path)?;
    f(&mut doc)?;
    Ok(doc)
}

fn set_str(doc: &mut ConfigDoc, path: &str, value: Option<String>) -> Result<()> {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => doc.set_path(path, Value::String(v)),
        None => Ok(()),
    }
}

fn run_pipeline(doc: &ConfigDoc, stage: Option<&str>, dry_run: bool, yes: bool) -> Result<()> {
    let plan = match stage {
        Some(s) => plan_stage(doc, s)?,
        None => plan_for(doc)?,
    };
    let reg = builtin_registry()?;
    let ws_cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    let sink = Arc::new(StdoutSink::with_log_root(load_paths(&ws_cfg)?.build_dir.join("logs")));
    let mut ctx = ExecCtx::new(dry_run, sink);
    ctx.assume_yes = yes;
    execute_plan(doc, &plan, &reg, &mut ctx)
}

fn cmd_plan(path: &Path, dot: bool, stage: Option<&str>) -> Result<()> {
    let doc = config::load(path)?;
    let plan = match stage {
        Some(s) => plan_stage(&doc, s)?,
        None => plan_for(&doc)?,
    };

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<18}  {:<8} {:<10}  {}",
            i + 1,
            task.id,
            task.stage,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    // Best-effort pretty print of resolved config.
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn config_inputs(build: &Path) -> Result<(Vec<tracks::Track>, PathBuf)> {
    let doc = config::load(build)?;
    let ws_cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    let ws = load_paths(&ws_cfg)?;
    Ok((tracks::tracks(&doc, &ws)?, tracks::policy_path(&doc, &ws)?))
}

fn finish(set: tracks::ChangeSet, apply: bool) -> Result<()> {
    print!("{}", set.render(apply));
    if apply {
        set.apply()?;
    }
    Ok(())
}

fn cmd_config(cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { build, option } => {
            let (tracks, policy) = config_inputs(&build)?;
            print!("{}", tracks::show(&tracks, &policy, &option)?);
            Ok(())
        }
        ConfigCommand::Set {
            build,
            assignment,
            policy: section,
            apply,
        } => {
            let Some((option, value)) = assignment.split_once('=') else {
                return Err(Error::msg(format!(
                    "expected OPTION=VALUE, got '{assignment}'"
                )));
            };
            let (tracks, policy) = config_inputs(&build)?;
            let set = tracks::plan_set(
                &tracks,
                &policy,
                option.trim(),
                value.trim(),
                section.as_deref(),
            )?;
            finish(set, apply)
        }
        ConfigCommand::Remove {
            build,
            option,
            apply,
        } => {
            let (_, policy) = config_inputs(&build)?;
            finish(tracks::plan_remove(&policy, &option)?, apply)
        }
        ConfigCommand::Reconcile {
            build,
            fix,
            apply,
            verbose,
        } => {
            let (tracks, policy) = config_inputs(&build)?;
            let r = tracks::reconcile_tracks(&tracks, &policy, fix)?;
            println!("=== Sky1 Config Reconciliation ===\n");
            for (t, enabled) in &r.loaded {
                println!("  {:8} {:25} ({enabled} enabled options)", t.variant, t.file_name());
            }
            if r.loaded.len() < 2 {
                println!("\nNeed at least 2 configs to compare.");
                return Ok(());
            }
            println!();
            print!("{}", r.report.render(verbose));
            let violations = r.report.violations.len();
            if fix {
                println!();
                finish(r.fixes, apply)?;
                if apply {
                    return Ok(());
                }
            }
            if violations > 0 {
                return Err(Error::msg(format!("{violations} policy violation(s)")));
            }
            Ok(())
        }
        ConfigCommand::Review { old, new } => {
            print!("{}", tracks::review_files(&old, &new)?);
            Ok(())
        }
    }
}
