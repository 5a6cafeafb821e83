use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{parameter}': {reason}")]
    InvalidValue {
        parameter: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub scheduler: SchedulerConfig,
    pub early_stopping_patience: usize,
    pub checkpoint_interval: usize,
    pub log_interval: usize,
    /// Targets whose loss is computed on totals instead of per-atom values.
    pub per_structure_targets: Vec<String>,
    /// Target name -> atomic type -> fixed composition weight.
    pub fixed_composition_weights: BTreeMap<String, BTreeMap<i32, f64>>,
    /// Loss weights keyed by target name or `<target>_<parameter>_gradients`.
    pub loss_weights: BTreeMap<String, f64>,
    pub convergence_threshold: Option<f64>,
    pub distributed: bool,
    pub seed: u64,
}

#[derive(Default)]
pub struct TrainingConfigBuilder {
    batch_size: Option<usize>,
    num_epochs: Option<usize>,
    learning_rate: Option<f64>,
    scheduler_factor: Option<f64>,
    scheduler_patience: Option<usize>,
    min_lr: Option<f64>,
    early_stopping_patience: Option<usize>,
    checkpoint_interval: Option<usize>,
    log_interval: Option<usize>,
    per_structure_targets: Vec<String>,
    fixed_composition_weights: BTreeMap<String, BTreeMap<i32, f64>>,
    loss_weights: BTreeMap<String, f64>,
    convergence_threshold: Option<f64>,
    distributed: bool,
    seed: u64,
}

impl TrainingConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }
    pub fn num_epochs(mut self, epochs: usize) -> Self {
        self.num_epochs = Some(epochs);
        self
    }
    pub fn learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = Some(rate);
        self
    }
    pub fn scheduler_factor(mut self, factor: f64) -> Self {
        self.scheduler_factor = Some(factor);
        self
    }
    pub fn scheduler_patience(mut self, patience: usize) -> Self {
        self.scheduler_patience = Some(patience);
        self
    }
    pub fn min_lr(mut self, rate: f64) -> Self {
        self.min_lr = Some(rate);
        self
    }
    pub fn early_stopping_patience(mut self, patience: usize) -> Self {
        self.early_stopping_patience = Some(patience);
        self
    }
    pub fn checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }
    pub fn log_interval(mut self, interval: usize) -> Self {
        self.log_interval = Some(interval);
        self
    }
    pub fn per_structure_targets(mut self, targets: Vec<String>) -> Self {
        self.per_structure_targets = targets;
        self
    }
    pub fn fixed_composition_weights(
        mut self,
        weights: BTreeMap<String, BTreeMap<i32, f64>>,
    ) -> Self {
        self.fixed_composition_weights = weights;
        self
    }
    pub fn loss_weights(mut self, weights: BTreeMap<String, f64>) -> Self {
        self.loss_weights = weights;
        self
    }
    pub fn convergence_threshold(mut self, threshold: Option<f64>) -> Self {
        self.convergence_threshold = threshold;
        self
    }
    pub fn distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> Result<TrainingConfig, ConfigError> {
        let positive = |parameter: &'static str, value: usize| {
            if value == 0 {
                Err(ConfigError::InvalidValue {
                    parameter,
                    reason: "must be at least 1".into(),
                })
            } else {
                Ok(value)
            }
        };

        let learning_rate = self
            .learning_rate
            .ok_or(ConfigError::MissingParameter("learning_rate"))?;
        if !(learning_rate > 0.0 && learning_rate.is_finite()) {
            return Err(ConfigError::InvalidValue {
                parameter: "learning_rate",
                reason: format!("{learning_rate} is not a positive number"),
            });
        }
        let factor = self
            .scheduler_factor
            .ok_or(ConfigError::MissingParameter("scheduler_factor"))?;
        if !(factor > 0.0 && factor < 1.0) {
            return Err(ConfigError::InvalidValue {
                parameter: "scheduler_factor",
                reason: format!("{factor} is not in (0, 1)"),
            });
        }

        Ok(TrainingConfig {
            batch_size: positive(
                "batch_size",
                self.batch_size
                    .ok_or(ConfigError::MissingParameter("batch_size"))?,
            )?,
            num_epochs: self
                .num_epochs
                .ok_or(ConfigError::MissingParameter("num_epochs"))?,
            learning_rate,
            scheduler: SchedulerConfig {
                factor,
                patience: self
                    .scheduler_patience
                    .ok_or(ConfigError::MissingParameter("scheduler_patience"))?,
                min_lr: self.min_lr.unwrap_or(0.0),
            },
            early_stopping_patience: self
                .early_stopping_patience
                .ok_or(ConfigError::MissingParameter("early_stopping_patience"))?,
            checkpoint_interval: positive(
                "checkpoint_interval",
                self.checkpoint_interval
                    .ok_or(ConfigError::MissingParameter("checkpoint_interval"))?,
            )?,
            log_interval: positive(
                "log_interval",
                self.log_interval
                    .ok_or(ConfigError::MissingParameter("log_interval"))?,
            )?,
            per_structure_targets: self.per_structure_targets,
            fixed_composition_weights: self.fixed_composition_weights,
            loss_weights: self.loss_weights,
            convergence_threshold: self.convergence_threshold,
            distributed: self.distributed,
            seed: self.seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> TrainingConfigBuilder {
        TrainingConfigBuilder::new()
            .batch_size(4)
            .num_epochs(10)
            .learning_rate(1e-3)
            .scheduler_factor(0.5)
            .scheduler_patience(5)
            .early_stopping_patience(20)
            .checkpoint_interval(5)
            .log_interval(1)
    }

    #[test]
    fn complete_builder_produces_config() {
        let config = complete().build().unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.scheduler.min_lr, 0.0);
        assert!(!config.distributed);
    }

    #[test]
    fn missing_parameter_is_reported_by_name() {
        let result = TrainingConfigBuilder::new()
            .batch_size(4)
            .num_epochs(10)
            .build();
        assert_eq!(result, Err(ConfigError::MissingParameter("learning_rate")));
    }

    #[test]
    fn scheduler_factor_must_shrink_learning_rate() {
        let result = complete().scheduler_factor(1.5).build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                parameter: "scheduler_factor",
                ..
            })
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = complete().batch_size(0).build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                parameter: "batch_size",
                ..
            })
        ));
    }
}
