use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use kira_genedoc::builder::{BuildOptions, DocumentBuilder};
use kira_genedoc::config::{ConfigLoader, ResolvedConfig};
use kira_genedoc::error::KiraError;
use kira_genedoc::graph::EdgeLookup;
use kira_genedoc::output::{JsonOutput, LogOutput, OutputMode, ProgressSink, print_build_summary};
use kira_genedoc::store::Store;
use kira_genedoc::target::JsonTargetBackend;

#[derive(Parser)]
#[command(name = "kira-genedoc")]
#[command(about = "Merge per-source gene records into one document per canonical gene id")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a build and write a target collection")]
    Build(BuildArgs),
    #[command(about = "Validate configuration and translation paths without reading sources")]
    Check(CheckArgs),
    #[command(about = "List builds, sources, translation edges and stored targets")]
    List(ListArgs),
}

#[derive(Args)]
struct BuildArgs {
    build: String,

    #[arg(long)]
    config: Option<String>,

    /// Re-merge only these sources into an existing target.
    #[arg(long, value_delimiter = ',')]
    sources: Option<Vec<String>>,

    #[arg(long)]
    target: Option<String>,

    #[arg(long)]
    parallel: bool,
}

#[derive(Args)]
struct CheckArgs {
    build: Option<String>,

    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    config: Option<String>,
}

#[derive(Serialize)]
struct ListResult {
    builds: Vec<String>,
    sources: Vec<String>,
    edges: Vec<ListEdge>,
    targets: Vec<String>,
}

#[derive(Serialize)]
struct ListEdge {
    from: String,
    to: String,
    lookup: String,
}

#[derive(Serialize)]
struct CheckResult {
    checked: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MappingLoad { .. } | KiraError::SourceRead { .. } => 3,
        error if error.is_config_error() => 2,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Build(args) => run_build(args, output_mode),
        Commands::Check(args) => run_check(args, output_mode),
        Commands::List(args) => run_list(args, output_mode),
    }
}

fn load(config: Option<&str>) -> miette::Result<(ResolvedConfig, Store, DocumentBuilder)> {
    let resolved = ConfigLoader::resolve(config)?;
    let store = resolved.store(Store::new()?);
    let backend = Arc::new(JsonTargetBackend::new(store.clone()));
    let builder = resolved.into_builder(&store, backend)?;
    Ok((resolved, store, builder))
}

fn run_build(args: BuildArgs, output_mode: OutputMode) -> miette::Result<()> {
    let (_, store, builder) = load(args.config.as_deref())?;
    store.ensure_project_root()?;

    let options = BuildOptions {
        parallel: args.parallel,
        ..BuildOptions::default()
    };
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::NonInteractive => &JsonOutput,
        OutputMode::Interactive => &LogOutput,
    };
    let result = builder.merge(
        &args.build,
        args.sources.as_deref(),
        args.target.as_deref(),
        &options,
        sink,
    )?;

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_build(&result).into_diagnostic()?,
        OutputMode::Interactive => print_build_summary(&result),
    }
    Ok(())
}

fn run_check(args: CheckArgs, output_mode: OutputMode) -> miette::Result<()> {
    let (_, _, builder) = load(args.config.as_deref())?;
    let names = match args.build {
        Some(name) => vec![name],
        None => builder.builds().map(|build| build.name.clone()).collect(),
    };
    for name in &names {
        builder.check(name)?;
    }

    match output_mode {
        OutputMode::NonInteractive => {
            JsonOutput::print_json(&CheckResult { checked: names }).into_diagnostic()?
        }
        OutputMode::Interactive => {
            for name in &names {
                println!("build {name}: ok");
            }
        }
    }
    Ok(())
}

fn run_list(args: ListArgs, output_mode: OutputMode) -> miette::Result<()> {
    let (_, store, builder) = load(args.config.as_deref())?;
    let result = ListResult {
        builds: builder.builds().map(|build| build.name.clone()).collect(),
        sources: builder.sources().names().map(str::to_string).collect(),
        edges: builder
            .graph()
            .edges()
            .iter()
            .map(|edge| ListEdge {
                from: edge.from.to_string(),
                to: edge.to.to_string(),
                lookup: match &edge.lookup {
                    EdgeLookup::Mapper(mapper) => format!("mapper {}", mapper.name()),
                    EdgeLookup::Table { table } => format!("table {table}"),
                },
            })
            .collect(),
        targets: store.list_targets()?,
    };

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_json(&result).into_diagnostic()?,
        OutputMode::Interactive => {
            println!("builds:  {}", result.builds.join(", "));
            println!("sources: {}", result.sources.join(", "));
            println!("edges:");
            for edge in &result.edges {
                println!("  {} -> {} ({})", edge.from, edge.to, edge.lookup);
            }
            println!("targets:");
            for target in &result.targets {
                println!("  {target}");
            }
        }
    }
    Ok(())
}
