use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use lull_cli::live::{LiveEvent, LiveSession};
use lull_cli::pipeline::{OperatorKind, Pipeline};
use lull_cli::replay::{parse_script, run_replay};
use lull_core::{Config, Paths};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lull", version, about = "Debounce or throttle a stream of input lines")]
struct Cli {
    /// Config file to use instead of the XDG default
    #[arg(long = "config", global = true, env = "LULL_CONFIG")]
    config_file: Option<PathBuf>,
    /// Override the XDG base directory root
    #[arg(long, global = true, env = "LULL_XDG_ROOT")]
    xdg_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug)]
struct Overrides {
    config: Option<PathBuf>,
    xdg_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read lines from stdin and print what the operator emits
    Live {
        #[command(flatten)]
        operator: OperatorArgs,
        /// Emit JSON lines with wall-clock timestamps
        #[arg(long)]
        json: bool,
    },
    /// Replay a JSON-lines script on virtual time
    Replay {
        #[command(flatten)]
        operator: OperatorArgs,
        /// Script with one {"at_ms": N, "value": "..."} object per line
        #[arg(required = true)]
        script: PathBuf,
        /// Emit JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Args)]
struct OperatorArgs {
    /// Operator to apply
    #[arg(long, value_enum, default_value = "debounce")]
    mode: OperatorKind,
    /// Interval in milliseconds (defaults to the config file)
    #[arg(long)]
    interval_ms: Option<u64>,
    /// Throttle only: emit the latest value at each window boundary
    #[arg(long, value_name = "BOOL")]
    emit_latest: Option<bool>,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show,
}

fn main() -> Result<()> {
    init_tracing();
    let Cli {
        command,
        config_file,
        xdg_root,
    } = Cli::parse();
    let overrides = Overrides {
        config: config_file,
        xdg_root,
    };
    match command {
        Commands::Live { operator, json } => run_live(&overrides, operator, json),
        Commands::Replay {
            operator,
            script,
            json,
        } => run_replay_cmd(&overrides, operator, script, json),
        Commands::Config { command } => run_config(&overrides, command),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run_live(overrides: &Overrides, operator: OperatorArgs, json: bool) -> Result<()> {
    let pipeline = resolve_pipeline(overrides, &operator)?;
    let session = LiveSession::new();
    install_signal_handler(session.sender())?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    session.run(pipeline, io::BufReader::new(io::stdin()), &mut out, json)?;
    Ok(())
}

fn run_replay_cmd(
    overrides: &Overrides,
    operator: OperatorArgs,
    script: PathBuf,
    json: bool,
) -> Result<()> {
    let pipeline = resolve_pipeline(overrides, &operator)?;
    let text = std::fs::read_to_string(&script)
        .with_context(|| format!("read script {}", script.display()))?;
    let lines = parse_script(&text)?;
    let emissions = run_replay(pipeline, &lines)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for emission in &emissions {
        emission.write_to(&mut out, json)?;
    }
    out.flush()?;
    Ok(())
}

fn run_config(overrides: &Overrides, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init { force } => {
            let path = config_path(overrides)?;
            if path.exists() && !force {
                return Err(anyhow!(
                    "config already exists at {}; pass --force to overwrite",
                    path.display()
                ));
            }
            Config::default()
                .write_to(&path)
                .with_context(|| format!("write config {}", path.display()))?;
            info!(path = %path.display(), "wrote default config");
            println!("{}", path.display());
            Ok(())
        }
        ConfigCommand::Show => {
            let config = load_config(overrides)?;
            print!("{}", config.to_toml_string().context("render config")?);
            Ok(())
        }
    }
}

fn resolve_pipeline(overrides: &Overrides, operator: &OperatorArgs) -> Result<Pipeline> {
    let config = load_config(overrides)?;
    Pipeline::resolve(
        operator.mode,
        operator.interval_ms,
        operator.emit_latest,
        &config,
    )
    .context("invalid operator settings")
}

fn config_path(overrides: &Overrides) -> Result<PathBuf> {
    if let Some(path) = &overrides.config {
        return Ok(path.clone());
    }
    let paths = Paths::new_with_override(overrides.xdg_root.as_deref())
        .context("resolve XDG paths")?;
    Ok(paths.config_file())
}

fn load_config(overrides: &Overrides) -> Result<Config> {
    let path = config_path(overrides)?;
    if !path.exists() {
        if overrides.config.is_some() {
            return Err(anyhow!("config not found at {}", path.display()));
        }
        debug!(path = %path.display(), "no config file; using defaults");
        return Ok(Config::default());
    }
    Config::load_from(&path).with_context(|| format!("load config {}", path.display()))
}

fn install_signal_handler(tx: mpsc::Sender<LiveEvent>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        for signal in signals.forever() {
            if tx.send(LiveEvent::Signal(signal)).is_err() {
                break;
            }
        }
    });
    Ok(())
}
