/// Values used for options that neither the options file nor `-S` sets.
pub struct DefaultsConfig {
    pub device: String,
    pub seed: u64,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub scheduler_factor: f64,
    pub scheduler_patience: usize,
    pub early_stopping_patience: usize,
    pub checkpoint_interval: usize,
    pub log_interval: usize,
    pub validation_fraction: f64,
    pub world_size: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            seed: 0,
            batch_size: 8,
            num_epochs: 100,
            learning_rate: 1e-3,
            scheduler_factor: 0.8,
            scheduler_patience: 100,
            early_stopping_patience: 200,
            checkpoint_interval: 25,
            log_interval: 5,
            validation_fraction: 0.1,
            world_size: 2,
        }
    }
}
