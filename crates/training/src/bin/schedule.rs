use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use depth_training::{schedule_rows, ScheduleRow, TrainingConfig, TrainingError};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("schedule failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Print the learning rate schedule of a training config",
    long_about = None
)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (.toml or .json)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Last step to print (defaults to total_iter_length)")]
    steps: Option<usize>,

    #[arg(long, default_value_t = 1, help = "Print every N-th step")]
    every: usize,

    #[arg(long, help = "Emit a JSON array instead of plain rows")]
    json: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::from_path(&args.config)?;
    if !args.overrides.is_empty() {
        config = config.with_overrides(
            args.overrides
                .iter()
                .map(|arg| (arg.path.as_str(), arg.value.as_str())),
        )?;
    }

    let rows = schedule_rows(&config, args.steps, args.every)?;
    log::info!("printing {} schedule rows", rows.len());
    println!("{}", render(&rows, args.json)?);
    Ok(())
}

fn render(rows: &[ScheduleRow], json: bool) -> Result<String, TrainingError> {
    if json {
        return serde_json::to_string_pretty(rows).map_err(|err| {
            TrainingError::runtime(format!("failed to render schedule as json: {err}"))
        });
    }

    let mut out = format!("{:>8} {:>12} {:>14}", "step", "multiplier", "learning_rate");
    for row in rows {
        out.push_str(&format!(
            "\n{:>8} {:>12.6} {:>14.6e}",
            row.step, row.multiplier, row.learning_rate
        ));
    }
    Ok(out)
}
