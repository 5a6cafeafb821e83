use super::config::SchedulerConfig;
use tracing::info;

const RELATIVE_THRESHOLD: f64 = 1e-4;
const MIN_CHANGE: f64 = 1e-8;

/// Reduces the learning rate when a minimized metric stops improving.
///
/// A metric counts as an improvement when it is below `best * (1 - 1e-4)`.
/// After more than `patience` epochs without improvement the rate is
/// multiplied by `factor`, never going below `min_lr`, and the count restarts.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: SchedulerConfig,
    best: f64,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Records `metric` and returns the learning rate to use from now on.
    pub fn step(&mut self, metric: f64, learning_rate: f64) -> f64 {
        if metric < self.best * (1.0 - RELATIVE_THRESHOLD) {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs <= self.config.patience {
            return learning_rate;
        }
        self.bad_epochs = 0;
        let reduced = (learning_rate * self.config.factor).max(self.config.min_lr);
        if learning_rate - reduced > MIN_CHANGE {
            info!("Reducing learning rate from {learning_rate:.4e} to {reduced:.4e}");
            reduced
        } else {
            learning_rate
        }
    }
}
