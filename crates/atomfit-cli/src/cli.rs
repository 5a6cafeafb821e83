use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "atomfit CLI - train, evaluate and export machine-learning interatomic potentials.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads used to build neighbor lists and graphs.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a model from an options file.
    Train(TrainArgs),
    /// Evaluate a model on a dataset.
    Eval(EvalArgs),
    /// Export a training checkpoint into a deployable model file.
    Export(ExportArgs),
}

/// Arguments for the `train` subcommand.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Path to the training options file in TOML format.
    #[arg(required = true, value_name = "OPTIONS")]
    pub options: PathBuf,

    /// Path of the final model checkpoint.
    #[arg(short, long, default_value = "model.ckpt", value_name = "PATH")]
    pub output: PathBuf,

    /// Continue training from a checkpoint.
    #[arg(short, long, value_name = "PATH")]
    pub continue_from: Option<PathBuf>,

    /// Directory for the checkpoints written during training.
    /// Defaults to the directory of the output file.
    #[arg(long, value_name = "DIR")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Write the metrics of every logged epoch to a CSV file.
    #[arg(long, value_name = "PATH")]
    pub history: Option<PathBuf>,

    /// Set a specific option, overriding the options file.
    /// Can be used multiple times. Example: -S training.batch-size=16
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `eval` subcommand.
#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Exported model or training checkpoint.
    #[arg(required = true, value_name = "MODEL")]
    pub model: PathBuf,

    /// Dataset file in TOML format.
    #[arg(required = true, value_name = "DATASET")]
    pub dataset: PathBuf,

    /// Base path of the prediction files, one per target.
    #[arg(short, long, default_value = "output.toml", value_name = "PATH")]
    pub output: PathBuf,

    /// Number of structures evaluated at once.
    #[arg(short, long, default_value_t = 1, value_name = "INT")]
    pub batch_size: usize,

    /// Device to evaluate on (`cpu`, `cuda`).
    #[arg(short, long, default_value = "cpu", value_name = "DEVICE")]
    pub device: String,
}

/// Arguments for the `export` subcommand.
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Training checkpoint to export.
    #[arg(required = true, value_name = "CHECKPOINT")]
    pub checkpoint: PathBuf,

    /// Path of the exported model.
    #[arg(short, long, default_value = "exported-model.atomfit", value_name = "PATH")]
    pub output: PathBuf,
}
