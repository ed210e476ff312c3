use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use statespace::adapters::{scenario, DfsSearch, ScriptedProgram, SCENARIOS};
use statespace::domain::{ClassRegistry, Vm};
use statespace::infrastructure::{dump_state, CoreConfig, TraceFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Statespace CLI
/// Explicit-state exploration of scripted concurrent programs
#[derive(Parser)]
#[command(name = "statespace")]
#[command(about = "Explicit-state model checking core", long_about = None, version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a choice trace file and print it
    Trace {
        file: PathBuf,
        /// Expected application name
        #[arg(short, long)]
        application: Option<String>,
    },
    /// Resolve a property file and print the configuration as JSON
    Config { file: PathBuf },
    /// Search a built-in scenario for property violations
    Explore {
        scenario: String,
        /// Property file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Where to store the first error trace
        #[arg(long)]
        trace_out: Option<PathBuf>,
    },
    /// Replay a stored trace on a built-in scenario and dump the final state
    Replay {
        scenario: String,
        trace: PathBuf,
        /// Property file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Trace { file, application } => {
            let trace = TraceFile::read(&file, application.as_deref())
                .with_context(|| format!("reading trace {}", file.display()))?;
            print!("{}", trace.render(true));
        }
        Commands::Config { file } => {
            let config = CoreConfig::from_file(&file).with_context(|| format!("loading {}", file.display()))?;
            println!("{}", config.to_json()?);
        }
        Commands::Explore {
            scenario: name,
            config,
            trace_out,
        } => explore(&name, config.as_deref(), trace_out)?,
        Commands::Replay {
            scenario: name,
            trace,
            config,
        } => replay(&name, &trace, config.as_deref())?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>, scenario: &str) -> Result<CoreConfig> {
    let mut config = match path {
        Some(p) => CoreConfig::from_file(p).with_context(|| format!("loading {}", p.display()))?,
        None => CoreConfig::default(),
    };
    config.target = scenario.to_string();
    Ok(config)
}

fn program(name: &str) -> Result<ScriptedProgram> {
    match scenario(name) {
        Some(p) => Ok(ScriptedProgram::new(p)),
        None => bail!("unknown scenario '{name}', expected one of: {}", SCENARIOS.join(", ")),
    }
}

fn explore(name: &str, config_path: Option<&Path>, trace_out: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path, name)?;
    let engine = program(name)?;
    let mut search = DfsSearch::with_engine(&config, Arc::new(ClassRegistry::new()), engine)
        .context("initializing the vm")?;
    let reports = search.run().context("search aborted")?.to_vec();

    let stats = search.stats();
    println!(
        "transitions={} states={} backtracks={} end_states={} max_depth={}",
        stats.transitions, stats.visited_states, stats.backtracks, stats.end_states, stats.max_depth
    );
    if reports.is_empty() {
        println!("no errors detected");
        return Ok(());
    }
    for report in &reports {
        println!("error: {} (depth {})", report.finding, report.depth);
    }

    let out = trace_out.or_else(|| config.trace.file.clone());
    if let Some(path) = out {
        reports[0]
            .trace
            .store(&path, config.trace.verbose)
            .with_context(|| format!("writing trace {}", path.display()))?;
        info!(path = %path.display(), "error trace stored");
    }
    Ok(())
}

fn replay(name: &str, trace_path: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path, name)?;
    let trace = TraceFile::read(trace_path, Some(name)).with_context(|| format!("reading trace {}", trace_path.display()))?;
    if let Some(comment) = &trace.comment {
        info!(comment = comment.as_str(), "replaying");
    }

    let mut vm = Vm::new(&config.vm, Arc::new(ClassRegistry::new()), program(name)?)?;
    vm.initialize().context("initializing the vm")?;
    let outcomes = vm.replay(trace.points).context("replay failed")?;
    if vm.is_deadlocked() {
        warn!("replay ended in a deadlock");
    }
    println!("# {} transitions, state {:?}", outcomes.len(), vm.state_id());
    print!("{}", dump_state(vm.kernel()));
    Ok(())
}
