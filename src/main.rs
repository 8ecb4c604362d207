use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pype::inference::Inferencer;
use pype::lockfile::generate_lock;
use pype::observability::log_snapshot;
use pype::packaging;
use pype::pipeline::ParameterTree;
use pype::presets::{PRESETS, generate_preset};
use pype::recipe::{Recipe, build_experiment};
use pype::registry::Registry;
use pype::validation::{ValidationReport, validate_recipe};
use serde_json::{Value, to_writer_pretty};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    let otlp_endpoint_for_tracing = match &command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match command {
        Commands::Run {
            recipe,
            params,
            output,
            dry_run,
            pin_dependencies,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            otlp_endpoint,
        } => {
            let _ = otlp_endpoint; // already handled in tracing configuration
            run_recipe(RunOptions {
                recipe,
                params,
                output,
                dry_run,
                pin_dependencies,
                print_metrics,
                metrics_json,
                metrics_prometheus,
            })
        }
        Commands::Predict {
            folder,
            input,
            output,
        } => predict(&folder, &input, output.as_deref()),
        Commands::Describe { folder } => describe(&folder),
        Commands::ListOperators => {
            list_components();
            Ok(())
        }
        Commands::Validate { recipe } => validate_recipe_cmd(recipe),
        Commands::Lock { recipe, output } => lock_recipe(recipe, output),
        Commands::Recipe { action } => recipe_command(action),
        Commands::Requirements {
            manifest_path,
            output,
        } => requirements(manifest_path.as_deref(), output.as_deref()),
        Commands::Digest { folder, verify } => digest(&folder, verify),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "pype", &mut io::stdout());
            Ok(())
        }
        Commands::Serve {
            folder,
            listen,
            recipe,
            track,
        } => parse_tracking(&track)
            .and_then(|track| serve(&folder, &listen, recipe.as_deref(), track)),
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "pype")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct RunOptions {
    recipe: PathBuf,
    params: Vec<String>,
    output: Option<PathBuf>,
    dry_run: bool,
    pin_dependencies: bool,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
}

fn run_recipe(options: RunOptions) -> Result<()> {
    let mut recipe = Recipe::load(&options.recipe)?;
    if let Some(output) = options.output {
        recipe.output.directory = output;
    }
    let registry = Registry::with_defaults();
    let report = validate_recipe(&recipe, &registry);
    report_validation(&options.recipe, &report)?;

    let overrides = parse_params(&options.params)?;
    let base_dir = recipe_dir(&options.recipe);

    if options.dry_run {
        info!(
            "Loaded recipe '{}' with {} pipeline node(s) and {} dataset(s)",
            recipe.name,
            recipe.pipeline.len(),
            recipe.data.len()
        );
        return Ok(());
    }

    let mut experiment = build_experiment(&recipe, base_dir, &registry, overrides)
        .with_context(|| format!("Failed to build experiment from {}", options.recipe.display()))?;
    if options.pin_dependencies {
        experiment.set_requirements(packaging::generate_requirements(None)?);
    }

    let metrics = experiment
        .run()
        .with_context(|| format!("Experiment '{}' failed", recipe.name))?;
    to_writer_pretty(io::stdout(), &metrics)?;
    println!();

    let snapshot = experiment.collector().snapshot();
    if options.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = options.metrics_json {
        ensure_parent(&path)?;
        let file = File::create(&path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = options.metrics_prometheus {
        ensure_parent(&path)?;
        fs::write(&path, snapshot.to_prometheus()).with_context(|| {
            format!("Failed to write Prometheus metrics: {}", path.display())
        })?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }

    Ok(())
}

/// Parses `path__to__arg=value` pairs. Values are read as JSON when they
/// parse, as plain strings otherwise.
fn parse_params(params: &[String]) -> Result<ParameterTree> {
    let entries = params
        .iter()
        .map(|param| {
            let (key, raw) = param
                .split_once('=')
                .ok_or_else(|| anyhow!("Parameter '{param}' must look like path__arg=value"))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((key.trim().to_string(), value))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ParameterTree::from_flat(entries)?)
}

/// Parses `name=path` pairs for `serve --track`.
fn parse_tracking(track: &[String]) -> Result<Vec<(String, PathBuf)>> {
    track
        .iter()
        .map(|entry| {
            let (name, path) = entry
                .split_once('=')
                .filter(|(name, path)| !name.trim().is_empty() && !path.is_empty())
                .ok_or_else(|| anyhow!("Tracking entry '{entry}' must look like name=path"))?;
            Ok((name.trim().to_string(), PathBuf::from(path)))
        })
        .collect()
}

fn recipe_dir(recipe: &Path) -> Option<&Path> {
    recipe.parent().filter(|parent| !parent.as_os_str().is_empty())
}

fn predict(folder: &Path, input: &Path, output: Option<&Path>) -> Result<()> {
    let inferencer = Inferencer::from_folder(folder, &Registry::with_defaults())
        .with_context(|| format!("Failed to load model from {}", folder.display()))?;
    let content = fs::read_to_string(input)
        .with_context(|| format!("Failed to read request: {}", input.display()))?;
    let request: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse request JSON: {}", input.display()))?;
    let response = inferencer.predict_json(&request)?;
    match output {
        Some(path) => {
            ensure_parent(path)?;
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            to_writer_pretty(file, &response)?;
            info!(output = %path.display(), "Predictions written");
        }
        None => {
            to_writer_pretty(io::stdout(), &response)?;
            println!();
        }
    }
    Ok(())
}

fn describe(folder: &Path) -> Result<()> {
    let inferencer = Inferencer::from_folder(folder, &Registry::with_defaults())
        .with_context(|| format!("Failed to load model from {}", folder.display()))?;
    let description = serde_json::json!({
        "model": inferencer.model().manifest(),
        "pipes": inferencer.pipeline().pipe_paths(),
        "request": inferencer.input_schema().json_schema(),
        "response": inferencer.output_schema().json_schema(),
    });
    to_writer_pretty(io::stdout(), &description)?;
    println!();
    Ok(())
}

fn list_components() {
    let registry = Registry::with_defaults();
    println!("Available operators:");
    for name in registry.operators.known() {
        println!("- {name}");
    }
    println!("Available estimators:");
    for name in registry.estimators.known() {
        println!("- {name}");
    }
    println!("Type-checked data kinds:");
    for kind in registry.type_checkers.kinds() {
        println!("- {kind}");
    }
}

fn report_validation(recipe_path: &Path, report: &ValidationReport) -> Result<()> {
    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }
    if report.is_ok() {
        return Ok(());
    }
    for error_msg in &report.errors {
        error!(file = %recipe_path.display(), "{error_msg}");
    }
    Err(anyhow!(
        "Recipe validation failed with {} error(s)",
        report.errors.len()
    ))
}

fn validate_recipe_cmd(recipe_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = Registry::with_defaults();
    let report = validate_recipe(&recipe, &registry);
    report_validation(&recipe_path, &report)?;
    info!(file = %recipe_path.display(), "Recipe validation passed");
    Ok(())
}

fn lock_recipe(recipe_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = Registry::with_defaults();
    let report = validate_recipe(&recipe, &registry);
    report_validation(&recipe_path, &report)
        .context("Cannot generate lockfile for an invalid recipe")?;

    ensure_parent(&output_path)?;
    generate_lock(&recipe, &registry, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );

    Ok(())
}

fn recipe_command(command: RecipeCommands) -> Result<()> {
    match command {
        RecipeCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("recipes/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset recipe generated"
            );
            Ok(())
        }
        RecipeCommands::Presets => {
            for name in PRESETS {
                println!("{name}");
            }
            Ok(())
        }
        RecipeCommands::Lint { recipes } => lint_recipes(&recipes),
    }
}

fn lint_recipes(recipes: &[PathBuf]) -> Result<()> {
    let registry = Registry::with_defaults();
    let mut failures = 0usize;

    for recipe_path in recipes {
        match Recipe::load(recipe_path) {
            Ok(recipe) => {
                let report = validate_recipe(&recipe, &registry);
                if report_validation(recipe_path, &report).is_ok() {
                    info!(file = %recipe_path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %recipe_path.display(), "Failed to load recipe: {err}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} recipe(s)");
    }

    info!("All recipe lint checks passed");
    Ok(())
}

fn requirements(manifest_path: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let lines = packaging::generate_requirements(manifest_path)?;
    match output {
        Some(path) => {
            ensure_parent(path)?;
            packaging::write_requirements(&lines, path)?;
            info!(requirements = %path.display(), count = lines.len(), "Requirements written");
        }
        None => {
            for line in lines {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn digest(folder: &Path, verify: bool) -> Result<()> {
    if verify {
        let mismatched = packaging::verify_digests(folder)?;
        if !mismatched.is_empty() {
            for name in &mismatched {
                error!(file = name.as_str(), "Digest mismatch");
            }
            bail!("{} artifact(s) changed since the run", mismatched.len());
        }
        info!(folder = %folder.display(), "All artifact digests match");
        return Ok(());
    }
    for (name, digest) in packaging::write_digests(folder)? {
        println!("{digest}  {name}");
    }
    Ok(())
}

#[cfg(feature = "serve")]
fn serve(
    folder: &Path,
    listen: &str,
    recipe: Option<&Path>,
    track: Vec<(String, PathBuf)>,
) -> Result<()> {
    use pype::data::SinkSpec;
    use pype::observability::MetricsCollector;
    use pype::serve::PredictionServer;
    use std::net::SocketAddr;
    use std::sync::Arc;

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid listen address: {listen}"))?;
    let inferencer = Inferencer::from_folder(folder, &Registry::with_defaults())
        .with_context(|| format!("Failed to load model from {}", folder.display()))?;
    let mut tracking = match recipe {
        Some(path) => Recipe::load(path)?.build_tracking(recipe_dir(path)),
        None => Default::default(),
    };
    for (name, path) in track {
        tracking.insert(name, Arc::from(SinkSpec::JsonLines { path }.build(None)));
    }
    let server = PredictionServer::start(addr, Arc::new(inferencer), MetricsCollector::new(), tracking)?;
    info!(address = %server.address(), "Serving predictions; stop with Ctrl-C");
    server.wait();
    Ok(())
}

#[cfg(not(feature = "serve"))]
fn serve(
    _folder: &Path,
    listen: &str,
    _recipe: Option<&Path>,
    _track: Vec<(String, PathBuf)>,
) -> Result<()> {
    bail!("Serving on {listen} requires the `serve` feature. Rebuild with --features serve.")
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "pype",
    version,
    about = "Experiment orchestration: fit, evaluate, persist and serve ML pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the experiment a recipe describes.
    Run {
        recipe: PathBuf,
        /// Parameter override such as `model__a=3` or `pipeline__scale__with_mean=false`.
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        /// Pin every dependency in requirements.txt via `cargo metadata`.
        #[arg(long)]
        pin_dependencies: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Predict with a finished run on a JSON request file.
    Predict {
        folder: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print model, pipes and request/response schemas of a finished run.
    Describe {
        folder: PathBuf,
    },
    ListOperators,
    Validate {
        recipe: PathBuf,
    },
    Lock {
        recipe: PathBuf,
        output: PathBuf,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
    /// Print or write pinned requirement lines (default output: stdout).
    Requirements {
        #[arg(long)]
        manifest_path: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Digest {
        folder: PathBuf,
        #[arg(long)]
        verify: bool,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    Serve {
        folder: PathBuf,
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
        /// Recipe whose `tracking` section names the sinks to record into.
        #[arg(long)]
        recipe: Option<PathBuf>,
        /// Append the named input or output to a JSON lines file.
        #[arg(long, value_name = "NAME=PATH")]
        track: Vec<String>,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Presets,
    Lint {
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },
}
