mod defaults;

use crate::cli::TrainArgs;
use crate::error::{CliError, Result};
use atomfit::architectures::radial_pair::{
    ARCHITECTURE_NAME, RadialPairHypers, RadialPairHypersBuilder,
};
use atomfit::core::io::elements::atomic_number;
use atomfit::engine::config::{TrainingConfig, TrainingConfigBuilder};
use defaults::DefaultsConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialArchitectureConfig {
    name: Option<String>,
    cutoff: Option<f64>,
    num_basis: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialTrainingConfig {
    batch_size: Option<usize>,
    num_epochs: Option<usize>,
    learning_rate: Option<f64>,
    scheduler_factor: Option<f64>,
    scheduler_patience: Option<usize>,
    min_lr: Option<f64>,
    early_stopping_patience: Option<usize>,
    checkpoint_interval: Option<usize>,
    log_interval: Option<usize>,
    per_structure_targets: Option<Vec<String>>,
    loss_weights: Option<BTreeMap<String, f64>>,
    /// Target -> element symbol or atomic number -> weight.
    fixed_composition_weights: Option<BTreeMap<String, BTreeMap<String, f64>>>,
    convergence_threshold: Option<f64>,
    distributed: Option<bool>,
    world_size: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialDataConfig {
    train: Option<PathBuf>,
    validation: Option<PathBuf>,
    validation_fraction: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PartialTrainOptions {
    device: Option<String>,
    seed: Option<u64>,
    architecture: Option<PartialArchitectureConfig>,
    training: Option<PartialTrainingConfig>,
    data: Option<PartialDataConfig>,
}

/// Where the validation structures come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationSource {
    File(PathBuf),
    /// A random fraction of the training file.
    Split { fraction: f64 },
}

/// Fully resolved options of a training run.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub device: String,
    pub seed: u64,
    pub hypers: RadialPairHypers,
    pub training: TrainingConfig,
    /// Number of in-process members of a distributed run, 1 otherwise.
    pub world_size: usize,
    pub train_path: PathBuf,
    pub validation: ValidationSource,
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid value for {key}: {value}")))
}

fn parse_species(key: &str) -> Result<i32> {
    key.parse()
        .ok()
        .or_else(|| atomic_number(key))
        .ok_or_else(|| CliError::Config(format!("Unknown atomic type '{key}'")))
}

impl PartialTrainOptions {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading training options from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content, path)
    }

    fn parse_str(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    /// Applies the `-S` settings of `args` and fills in defaults.
    ///
    /// Relative dataset paths are resolved against `base_dir`, the directory
    /// of the options file.
    pub fn merge_with_cli(mut self, args: &TrainArgs, base_dir: &Path) -> Result<TrainOptions> {
        self.apply_set_values(&args.set_values)?;
        let defaults = DefaultsConfig::default();

        let architecture = self.architecture.take().unwrap_or_default();
        let training = self.training.take().unwrap_or_default();
        let data = self.data.take().unwrap_or_default();
        let seed = self.seed.unwrap_or(defaults.seed);

        if let Some(name) = architecture.name.as_deref().filter(|n| *n != ARCHITECTURE_NAME) {
            return Err(CliError::Config(format!(
                "Unknown architecture '{name}', the only available one is '{ARCHITECTURE_NAME}'"
            )));
        }
        let mut hypers = RadialPairHypersBuilder::new().seed(seed);
        if let Some(cutoff) = architecture.cutoff {
            hypers = hypers.cutoff(cutoff);
        }
        if let Some(num_basis) = architecture.num_basis {
            hypers = hypers.num_basis(num_basis);
        }
        let hypers = hypers
            .build()
            .map_err(|e| CliError::Config(format!("architecture: {e}")))?;

        let fixed_composition_weights = training
            .fixed_composition_weights
            .unwrap_or_default()
            .into_iter()
            .map(|(target, weights)| {
                let weights = weights
                    .into_iter()
                    .map(|(species, weight)| Ok((parse_species(&species)?, weight)))
                    .collect::<Result<BTreeMap<_, _>>>()?;
                Ok((target, weights))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let distributed = training.distributed.unwrap_or(false);
        let world_size = if distributed {
            training.world_size.unwrap_or(defaults.world_size)
        } else {
            1
        };
        if world_size == 0 {
            return Err(CliError::Config("`training.world-size` must be at least 1".into()));
        }

        let config = TrainingConfigBuilder::new()
            .batch_size(training.batch_size.unwrap_or(defaults.batch_size))
            .num_epochs(training.num_epochs.unwrap_or(defaults.num_epochs))
            .learning_rate(training.learning_rate.unwrap_or(defaults.learning_rate))
            .scheduler_factor(training.scheduler_factor.unwrap_or(defaults.scheduler_factor))
            .scheduler_patience(
                training
                    .scheduler_patience
                    .unwrap_or(defaults.scheduler_patience),
            )
            .min_lr(training.min_lr.unwrap_or(0.0))
            .early_stopping_patience(
                training
                    .early_stopping_patience
                    .unwrap_or(defaults.early_stopping_patience),
            )
            .checkpoint_interval(
                training
                    .checkpoint_interval
                    .unwrap_or(defaults.checkpoint_interval),
            )
            .log_interval(training.log_interval.unwrap_or(defaults.log_interval))
            .per_structure_targets(training.per_structure_targets.unwrap_or_default())
            .loss_weights(training.loss_weights.unwrap_or_default())
            .fixed_composition_weights(fixed_composition_weights)
            .convergence_threshold(training.convergence_threshold)
            .distributed(distributed)
            .seed(seed)
            .build()
            .map_err(|e| CliError::Config(format!("training: {e}")))?;

        let train_path = data
            .train
            .map(|p| base_dir.join(p))
            .ok_or_else(|| CliError::Config("`data.train` is required.".to_string()))?;
        let validation = match (data.validation, data.validation_fraction) {
            (Some(_), Some(_)) => {
                return Err(CliError::Config(
                    "`data.validation` and `data.validation-fraction` are mutually exclusive"
                        .to_string(),
                ));
            }
            (Some(path), None) => ValidationSource::File(base_dir.join(path)),
            (None, fraction) => ValidationSource::Split {
                fraction: fraction.unwrap_or(defaults.validation_fraction),
            },
        };

        Ok(TrainOptions {
            device: self.device.unwrap_or(defaults.device),
            seed,
            hypers,
            training: config,
            world_size,
            train_path,
            validation,
        })
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let (key, value) = kv_pair.split_once('=').ok_or_else(|| {
                CliError::Config(format!(
                    "Invalid --set format: '{kv_pair}'. Expected KEY=VALUE."
                ))
            })?;

            if let Some(field) = key.strip_prefix("architecture.") {
                let architecture = self.architecture.get_or_insert_with(Default::default);
                match field {
                    "name" => architecture.name = Some(value.to_string()),
                    "cutoff" => architecture.cutoff = Some(parse(key, value)?),
                    "num-basis" => architecture.num_basis = Some(parse(key, value)?),
                    _ => return Err(unsupported(key)),
                }
            } else if let Some(field) = key.strip_prefix("training.") {
                let training = self.training.get_or_insert_with(Default::default);
                match field {
                    "batch-size" => training.batch_size = Some(parse(key, value)?),
                    "num-epochs" => training.num_epochs = Some(parse(key, value)?),
                    "learning-rate" => training.learning_rate = Some(parse(key, value)?),
                    "scheduler-factor" => training.scheduler_factor = Some(parse(key, value)?),
                    "scheduler-patience" => training.scheduler_patience = Some(parse(key, value)?),
                    "min-lr" => training.min_lr = Some(parse(key, value)?),
                    "early-stopping-patience" => {
                        training.early_stopping_patience = Some(parse(key, value)?)
                    }
                    "checkpoint-interval" => {
                        training.checkpoint_interval = Some(parse(key, value)?)
                    }
                    "log-interval" => training.log_interval = Some(parse(key, value)?),
                    "convergence-threshold" => {
                        training.convergence_threshold = Some(parse(key, value)?)
                    }
                    "distributed" => training.distributed = Some(parse(key, value)?),
                    "world-size" => training.world_size = Some(parse(key, value)?),
                    _ => return Err(unsupported(key)),
                }
            } else if let Some(field) = key.strip_prefix("data.") {
                let data = self.data.get_or_insert_with(Default::default);
                match field {
                    "train" => data.train = Some(PathBuf::from(value)),
                    "validation" => data.validation = Some(PathBuf::from(value)),
                    "validation-fraction" => data.validation_fraction = Some(parse(key, value)?),
                    _ => return Err(unsupported(key)),
                }
            } else {
                match key {
                    "device" => self.device = Some(value.to_string()),
                    "seed" => self.seed = Some(parse(key, value)?),
                    _ => return Err(unsupported(key)),
                }
            }
        }
        Ok(())
    }
}

fn unsupported(key: &str) -> CliError {
    CliError::Config(format!("Unsupported configuration key for --set: '{key}'"))
}
