use crate::architectures::{TrainableModel, save_model};
use crate::core::capabilities::TargetInfo;
use crate::core::io::checkpoint::CheckpointKind;
use crate::core::models::dataset::Dataset;
use crate::core::tensor::map::TensorMap;
use crate::engine::composition::{calculate_composition_weights, fixed_composition_weights};
use crate::engine::config::{ConfigError, TrainingConfig};
use crate::engine::data::{
    Batch, BatchLoader, ShardSampler, attach_neighbor_lists, check_datasets, get_all_targets,
};
use crate::engine::distributed::{AbortOnDrop, Communicator};
use crate::engine::error::EngineError;
use crate::engine::evaluate::{evaluate_model, keep_gradient_graphs};
use crate::engine::loss::{TensorMapDictLoss, average_by_num_atoms};
use crate::engine::metrics::{MetricLogger, RmseAccumulator};
use crate::engine::model::ModelHandle;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::scheduler::PlateauScheduler;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Everything a training run needs besides the model and the data.
pub struct TrainingContext<'a> {
    pub config: &'a TrainingConfig,
    pub communicator: &'a dyn Communicator,
    pub reporter: &'a ProgressReporter<'a>,
    /// Directory receiving `model_<epoch>.ckpt` files; `None` disables
    /// intermediate checkpoints.
    pub checkpoint_dir: Option<&'a Path>,
    /// CSV file receiving one row of metrics per logged epoch.
    pub history_path: Option<&'a Path>,
    /// Number of the first epoch, non-zero when continuing a run.
    pub start_epoch: usize,
}

/// Why a training run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingOutcome {
    /// The validation loss dropped below the convergence threshold.
    Converged { epoch: usize },
    MaxEpochs,
    EarlyStopped { epoch: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: BTreeMap<String, f64>,
    pub validation: BTreeMap<String, f64>,
    pub learning_rate: f64,
}

impl EpochMetrics {
    pub fn train_loss(&self) -> f64 {
        self.train.get("loss").copied().unwrap_or_default()
    }

    pub fn validation_loss(&self) -> f64 {
        self.validation.get("loss").copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub outcome: TrainingOutcome,
    pub history: Vec<EpochMetrics>,
    pub best_validation_loss: f64,
    pub learning_rate: f64,
}

impl TrainingSummary {
    /// The last epoch that ran, if any.
    pub fn last_epoch(&self) -> Option<usize> {
        self.history.last().map(|m| m.epoch)
    }
}

/// Trains `model` on `train` and validates it on `validation`.
///
/// `novel_outputs` are the outputs the model did not have before this run;
/// their composition weights are fixed from the configuration or fitted on
/// the training data before the first epoch.
///
/// In a distributed run every member of the communicator's group must call
/// this function with the same datasets and configuration. Samples are
/// sharded across members, gradients and losses are reduced, and only the
/// leader writes checkpoints and the metric history.
///
/// # Errors
///
/// Fails on datasets the model cannot handle, on composition weights that
/// cannot be determined, on evaluation failures and on failed collectives.
#[instrument(skip_all, name = "training_workflow")]
pub fn run<M: TrainableModel>(
    model: &mut M,
    novel_outputs: &[String],
    train: &mut [Dataset],
    validation: &mut [Dataset],
    context: &TrainingContext,
) -> Result<TrainingSummary, EngineError> {
    let config = context.config;
    let communicator = context.communicator;
    let reporter = context.reporter;
    let abort_guard = AbortOnDrop::new(communicator);
    keep_gradient_graphs();

    // === Phase 0: Preparation ===
    reporter.report(Progress::PhaseStart {
        name: "Preparation",
    });
    info!(
        rank = communicator.rank(),
        world_size = communicator.world_size(),
        "Setting up training."
    );

    check_datasets(train, validation, model.capabilities())?;
    let requested = model.requested_neighbor_lists();
    for dataset in train.iter_mut().chain(validation.iter_mut()) {
        attach_neighbor_lists(dataset, &requested)?;
    }

    for output in novel_outputs {
        assign_composition_weights(model, output, train, config)?;
    }

    let targets = training_targets(model, train, validation);
    let loss_fn = TensorMapDictLoss::from_targets(&targets, &config.loss_weights);
    let not_per_atom: Vec<String> = std::iter::once("positions_gradients".to_string())
        .chain(config.per_structure_targets.iter().cloned())
        .collect();

    let (train_loader, validation_loader) = build_loaders(train, validation, config, communicator);
    if train_loader.len(context.start_epoch) == 0 {
        return Err(ConfigError::InvalidValue {
            parameter: "batch_size",
            reason: format!(
                "{} is larger than every training dataset, no full batch is left",
                config.batch_size
            ),
        }
        .into());
    }
    if validation_loader.is_empty() {
        warn!("The validation datasets are empty; the validation loss will be zero.");
    }

    let variables = model.trainable_variables();
    let mut optimizer = AdamW::new(
        variables.clone(),
        ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;
    let mut scheduler = PlateauScheduler::new(config.scheduler.clone());

    let mut logger = if communicator.is_leader() {
        let logger = MetricLogger::new(model.capabilities(), &["train", "validation"]);
        Some(match context.history_path {
            Some(path) => logger.with_history(path)?,
            None => logger,
        })
    } else {
        None
    };

    reporter.report(Progress::PhaseFinish);

    // === Phase 1: Epoch loop ===
    reporter.report(Progress::PhaseStart { name: "Training" });
    reporter.report(Progress::TaskStart {
        total_steps: config.num_epochs as u64,
    });
    info!("Starting training for {} epochs.", config.num_epochs);

    let mut history = Vec::with_capacity(config.num_epochs);
    let mut best_validation_loss = f64::INFINITY;
    let mut epochs_without_improvement = 0;
    let mut outcome = TrainingOutcome::MaxEpochs;

    let first = context.start_epoch;
    for epoch in first..first + config.num_epochs {
        communicator.barrier()?;

        let train_metrics = run_pass(
            model,
            &train_loader,
            epoch,
            &targets,
            &loss_fn,
            Some((&mut optimizer, variables.as_slice())),
            &not_per_atom,
            context,
        )?;

        communicator.barrier()?;

        let validation_metrics = run_pass(
            model,
            &validation_loader,
            epoch,
            &targets,
            &loss_fn,
            None,
            &not_per_atom,
            context,
        )?;

        let train_loss = train_metrics.get("loss").copied().unwrap_or_default();
        let validation_loss = validation_metrics.get("loss").copied().unwrap_or_default();

        let learning_rate = scheduler.step(validation_loss, optimizer.learning_rate());
        optimizer.set_learning_rate(learning_rate);

        if let Some(logger) = logger.as_mut().filter(|_| epoch % config.log_interval == 0) {
            logger.log(&[train_metrics.clone(), validation_metrics.clone()], epoch)?;
        }
        reporter.report(Progress::EpochFinished {
            epoch,
            train_loss,
            validation_loss,
            learning_rate,
        });
        reporter.report(Progress::TaskIncrement);
        history.push(EpochMetrics {
            epoch,
            train: train_metrics,
            validation: validation_metrics,
            learning_rate,
        });

        if epoch % config.checkpoint_interval == 0 {
            communicator.barrier()?;
            if let (true, Some(dir)) = (communicator.is_leader(), context.checkpoint_dir) {
                let path = dir.join(format!("model_{epoch}.ckpt"));
                save_model(&*model, &path, CheckpointKind::Training, Some(epoch))?;
                debug!(path = %path.display(), "Wrote checkpoint");
            }
        }

        if config
            .convergence_threshold
            .is_some_and(|threshold| validation_loss < threshold)
        {
            info!("Validation loss {validation_loss:.4e} is below the convergence threshold.");
            outcome = TrainingOutcome::Converged { epoch };
            break;
        }

        if validation_loss < best_validation_loss {
            best_validation_loss = validation_loss;
            epochs_without_improvement = 0;
        } else {
            epochs_without_improvement += 1;
            if epochs_without_improvement >= config.early_stopping_patience {
                info!(
                    "Early stopping criterion reached after {} epochs without improvement.",
                    config.early_stopping_patience
                );
                outcome = TrainingOutcome::EarlyStopped { epoch };
                break;
            }
        }
    }

    communicator.barrier()?;
    reporter.report(Progress::TaskFinish);
    reporter.report(Progress::PhaseFinish);

    info!(?outcome, "Training finished.");
    abort_guard.disarm();
    Ok(TrainingSummary {
        outcome,
        history,
        best_validation_loss,
        learning_rate: optimizer.learning_rate(),
    })
}

fn assign_composition_weights<M: TrainableModel>(
    model: &mut M,
    output: &str,
    train: &[Dataset],
    config: &TrainingConfig,
) -> Result<(), EngineError> {
    let weights = match config.fixed_composition_weights.get(output) {
        Some(fixed) => {
            info!("Using fixed composition weights for '{output}'.");
            fixed_composition_weights(output, fixed, &model.capabilities().atomic_types)?
        }
        None => calculate_composition_weights(train, output)?,
    };
    model.set_composition_weights(output, &weights)?;
    Ok(())
}

/// Target descriptions of every target found in the datasets.
fn training_targets<M: TrainableModel>(
    model: &M,
    train: &[Dataset],
    validation: &[Dataset],
) -> BTreeMap<String, TargetInfo> {
    let known = &model.dataset_info().targets;
    get_all_targets(train)
        .into_iter()
        .chain(get_all_targets(validation))
        .filter_map(|name| {
            let info = known
                .get(&name)
                .cloned()
                .or_else(|| {
                    model
                        .capabilities()
                        .outputs
                        .get(&name)
                        .map(|o| TargetInfo {
                            quantity: o.quantity.clone(),
                            unit: o.unit.clone(),
                            per_atom: o.per_atom,
                            gradients: Default::default(),
                        })
                })?;
            Some((name, info))
        })
        .collect()
}

fn build_loaders<'d>(
    train: &'d [Dataset],
    validation: &'d [Dataset],
    config: &TrainingConfig,
    communicator: &dyn Communicator,
) -> (BatchLoader<'d>, BatchLoader<'d>) {
    if communicator.is_distributed() {
        let sampler = ShardSampler {
            num_replicas: communicator.world_size(),
            rank: communicator.rank(),
            shuffle: true,
            seed: config.seed,
            drop_last: true,
        };
        (
            BatchLoader::new(train, config.batch_size, false, sampler),
            BatchLoader::new(validation, config.batch_size, false, sampler),
        )
    } else {
        (
            BatchLoader::new(
                train,
                config.batch_size,
                true,
                ShardSampler::single(true, config.seed),
            ),
            BatchLoader::new(
                validation,
                config.batch_size,
                false,
                ShardSampler::single(false, config.seed),
            ),
        )
    }
}

/// One pass over `loader`. With an optimizer the parameters are updated
/// after every batch.
#[allow(clippy::too_many_arguments)]
fn run_pass<M: TrainableModel>(
    model: &M,
    loader: &BatchLoader,
    epoch: usize,
    targets: &BTreeMap<String, TargetInfo>,
    loss_fn: &TensorMapDictLoss,
    mut optimizer: Option<(&mut AdamW, &[Var])>,
    not_per_atom: &[String],
    context: &TrainingContext,
) -> Result<BTreeMap<String, f64>, EngineError> {
    let communicator = context.communicator;
    let is_training = optimizer.is_some();
    let mut total_loss = 0.0;
    let mut rmse = RmseAccumulator::new();

    for indices in loader.batches(epoch) {
        let Batch {
            mut systems,
            targets: batch_targets,
        } = loader.load(&indices)?;
        let requested: BTreeMap<String, TargetInfo> = batch_targets
            .keys()
            .filter_map(|name| targets.get(name).map(|t| (name.clone(), t.clone())))
            .collect();
        let batch_targets: BTreeMap<String, TensorMap> = batch_targets
            .into_iter()
            .filter(|(name, _)| requested.contains_key(name))
            .collect();

        let predictions = evaluate_model(
            ModelHandle::Training(model),
            &mut systems,
            &requested,
            is_training,
        )?;
        let (predictions, batch_targets) = average_by_num_atoms(
            predictions,
            batch_targets,
            &systems,
            &context.config.per_structure_targets,
        )?;
        let loss = loss_fn.compute(&predictions, &batch_targets)?;

        if let Some((optimizer, variables)) = optimizer.as_mut() {
            let mut grads = loss.backward()?;
            if communicator.is_distributed() {
                all_reduce_gradients(&mut grads, *variables, communicator)?;
            }
            optimizer.step(&grads)?;
        }

        let mut loss_value = [loss.to_scalar::<f64>()?];
        communicator.all_reduce_sum(&mut loss_value)?;
        total_loss += loss_value[0];
        rmse.update(&predictions, &batch_targets)?;
    }

    let mut metrics = rmse.finalize(not_per_atom, communicator)?;
    metrics.insert("loss".to_string(), total_loss);
    Ok(metrics)
}

/// Replaces the gradient of every variable by its average over the group.
/// Variables without a gradient on some member count as zero there.
fn all_reduce_gradients(
    grads: &mut GradStore,
    variables: &[Var],
    communicator: &dyn Communicator,
) -> Result<(), EngineError> {
    let mut flat = Vec::with_capacity(variables.iter().map(|v| v.elem_count()).sum());
    for variable in variables {
        match grads.get(variable.as_tensor()) {
            Some(gradient) => flat.extend(gradient.flatten_all()?.to_vec1::<f64>()?),
            None => flat.extend(std::iter::repeat_n(0.0, variable.elem_count())),
        }
    }
    communicator.all_reduce_sum(&mut flat)?;

    let world_size = communicator.world_size() as f64;
    let mut offset = 0;
    for variable in variables {
        let n = variable.elem_count();
        let averaged: Vec<f64> = flat[offset..offset + n]
            .iter()
            .map(|g| g / world_size)
            .collect();
        let gradient = Tensor::from_vec(averaged, variable.shape(), variable.device())?;
        grads.insert(variable.as_tensor(), gradient);
        offset += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architectures::radial_pair::{RadialPairHypersBuilder, RadialPairModel};
    use crate::core::capabilities::DatasetInfo;
    use crate::core::io::dataset::parse_dataset;
    use crate::engine::config::TrainingConfigBuilder;
    use crate::engine::distributed::{DistributedError, SingleProcess, ThreadGroup};
    use crate::engine::loss::gradient_key;
    use crate::engine::model::AtomisticModel;
    use candle_core::Device;
    use std::thread;

    fn dimers(distances: &[f64]) -> String {
        let mut content = String::from("energy-unit = \"eV\"\n");
        for r in distances {
            let energy = -1.0 + 0.4 * (-(r - 1.0) * (r - 1.0) / 0.1).exp();
            content.push_str(&format!(
                "\n[[structure]]\ntypes = [\"H\", \"H\"]\npositions = [[0.0, 0.0, 0.0], [{r:.3}, 0.0, 0.0]]\nenergy = {energy:.6}\n"
            ));
        }
        content
    }

    fn dimers_with_forces(distances: &[f64]) -> String {
        let mut content = String::from("energy-unit = \"eV\"\n");
        for r in distances {
            let force = 0.8 * (r - 1.0);
            content.push_str(&format!(
                "\n[[structure]]\ntypes = [\"H\", \"H\"]\npositions = [[0.0, 0.0, 0.0], [{r:.3}, 0.0, 0.0]]\n\
                 energy = -1.0\nforces = [[{force:.6}, 0.0, 0.0], [{:.6}, 0.0, 0.0]]\n",
                -force
            ));
        }
        content
    }

    fn isolated_atoms() -> String {
        "energy-unit = \"eV\"\n\n[[structure]]\ntypes = [\"H\", \"H\"]\n\
         positions = [[0.0, 0.0, 0.0], [8.0, 0.0, 0.0]]\nenergy = -1.2\n"
            .to_string()
    }

    fn dataset(content: &str) -> (Dataset, DatasetInfo) {
        parse_dataset(content, Path::new("test.toml"), &Device::Cpu).unwrap()
    }

    fn model(info: &DatasetInfo) -> RadialPairModel {
        let hypers = RadialPairHypersBuilder::new()
            .cutoff(2.0)
            .num_basis(4)
            .seed(3)
            .build()
            .unwrap();
        RadialPairModel::new(hypers, info, &Device::Cpu).unwrap()
    }

    fn config(num_epochs: usize) -> TrainingConfigBuilder {
        TrainingConfigBuilder::new()
            .batch_size(2)
            .num_epochs(num_epochs)
            .learning_rate(0.02)
            .scheduler_factor(0.5)
            .scheduler_patience(100)
            .early_stopping_patience(100)
            .checkpoint_interval(5)
            .log_interval(1)
    }

    fn outputs(model: &RadialPairModel) -> Vec<String> {
        model.capabilities().outputs.keys().cloned().collect()
    }

    fn pair_weights(model: &RadialPairModel) -> Vec<f64> {
        model
            .state_tensors()
            .into_iter()
            .find(|(name, _)| name == "energy.pair_weights")
            .unwrap()
            .1
            .flatten_all()
            .unwrap()
            .to_vec1::<f64>()
            .unwrap()
    }

    #[test]
    fn training_reduces_the_validation_loss_and_writes_checkpoints() {
        let (train, info) = dataset(&dimers(&[0.8, 0.9, 1.0, 1.1, 1.2, 1.3, 1.4, 1.5]));
        let (validation, _) = dataset(&dimers(&[0.95, 1.25]));
        let mut model = model(&info);
        let config = config(20).build().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let history_path = dir.path().join("history.csv");
        let reporter = ProgressReporter::new();
        let context = TrainingContext {
            config: &config,
            communicator: &SingleProcess,
            reporter: &reporter,
            checkpoint_dir: Some(dir.path()),
            history_path: Some(&history_path),
            start_epoch: 0,
        };

        let novel = outputs(&model);
        let summary = run(&mut model, &novel, &mut [train], &mut [validation], &context).unwrap();

        assert_eq!(summary.outcome, TrainingOutcome::MaxEpochs);
        assert_eq!(summary.history.len(), 20);
        let first = summary.history[0].validation_loss();
        let last = summary.history[19].validation_loss();
        assert!(last < first, "validation loss went from {first} to {last}");
        assert!(summary.history[0].train.contains_key("energy RMSE (per atom)"));
        for epoch in [0, 5, 10, 15] {
            assert!(dir.path().join(format!("model_{epoch}.ckpt")).exists());
        }
        assert!(!dir.path().join("model_1.ckpt").exists());
        let csv = std::fs::read_to_string(&history_path).unwrap();
        assert_eq!(csv.lines().count(), 21);
    }

    #[test]
    fn force_only_loss_updates_the_weights() {
        let (train, info) = dataset(&dimers_with_forces(&[0.9, 1.1]));
        let (validation, _) = dataset(&dimers_with_forces(&[1.0]));
        assert!(info.targets["energy"].gradients.contains("positions"));
        let mut model = model(&info);
        let before = pair_weights(&model);
        let config = config(1)
            .loss_weights(BTreeMap::from([
                ("energy".to_string(), 0.0),
                (gradient_key("energy", "positions"), 1.0),
            ]))
            .build()
            .unwrap();
        let reporter = ProgressReporter::new();
        let context = TrainingContext {
            config: &config,
            communicator: &SingleProcess,
            reporter: &reporter,
            checkpoint_dir: None,
            history_path: None,
            start_epoch: 0,
        };

        let novel = outputs(&model);
        run(&mut model, &novel, &mut [train], &mut [validation], &context).unwrap();

        let after = pair_weights(&model);
        assert!(
            before.iter().zip(&after).any(|(a, b)| (a - b).abs() > 1e-9),
            "the force loss left the pair weights unchanged"
        );
    }

    #[test]
    fn convergence_threshold_stops_after_the_first_epoch() {
        let (train, info) = dataset(&dimers(&[0.9, 1.1]));
        let (validation, _) = dataset(&dimers(&[1.0]));
        let mut model = model(&info);
        let config = config(10).convergence_threshold(Some(1e9)).build().unwrap();
        let reporter = ProgressReporter::new();
        let context = TrainingContext {
            config: &config,
            communicator: &SingleProcess,
            reporter: &reporter,
            checkpoint_dir: None,
            history_path: None,
            start_epoch: 0,
        };

        let novel = outputs(&model);
        let summary = run(&mut model, &novel, &mut [train], &mut [validation], &context).unwrap();
        assert_eq!(summary.outcome, TrainingOutcome::Converged { epoch: 0 });
        assert_eq!(summary.last_epoch(), Some(0));
    }

    #[test]
    fn constant_validation_loss_triggers_early_stopping() {
        let (train, info) = dataset(&dimers(&[0.9, 1.1]));
        let (validation, _) = dataset(&isolated_atoms());
        let mut model = model(&info);
        let config = config(50).early_stopping_patience(2).build().unwrap();
        let reporter = ProgressReporter::new();
        let context = TrainingContext {
            config: &config,
            communicator: &SingleProcess,
            reporter: &reporter,
            checkpoint_dir: None,
            history_path: None,
            start_epoch: 0,
        };

        let novel = outputs(&model);
        let summary = run(&mut model, &novel, &mut [train], &mut [validation], &context).unwrap();
        assert_eq!(summary.outcome, TrainingOutcome::EarlyStopped { epoch: 2 });
        assert_eq!(summary.history.len(), 3);
    }

    #[test]
    fn batch_larger_than_the_training_set_is_rejected() {
        let (train, info) = dataset(&dimers(&[0.9]));
        let (validation, _) = dataset(&dimers(&[1.0]));
        let mut model = model(&info);
        let config = config(1).build().unwrap();
        let reporter = ProgressReporter::new();
        let context = TrainingContext {
            config: &config,
            communicator: &SingleProcess,
            reporter: &reporter,
            checkpoint_dir: None,
            history_path: None,
            start_epoch: 0,
        };

        let novel = outputs(&model);
        let result = run(&mut model, &novel, &mut [train], &mut [validation], &context);
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::InvalidValue {
                parameter: "batch_size",
                ..
            }))
        ));
    }

    #[test]
    fn fixed_composition_weights_must_cover_the_model_types() {
        let (train, info) = dataset(&dimers(&[0.9, 1.1]));
        let (validation, _) = dataset(&dimers(&[1.0]));
        let mut model = model(&info);
        let config = config(1)
            .fixed_composition_weights(BTreeMap::from([(
                "energy".to_string(),
                BTreeMap::from([(1, -0.5), (8, -2.0)]),
            )]))
            .build()
            .unwrap();
        let reporter = ProgressReporter::new();
        let context = TrainingContext {
            config: &config,
            communicator: &SingleProcess,
            reporter: &reporter,
            checkpoint_dir: None,
            history_path: None,
            start_epoch: 0,
        };

        let novel = outputs(&model);
        let result = run(&mut model, &novel, &mut [train], &mut [validation], &context);
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::InvalidValue {
                parameter: "fixed_composition_weights",
                ..
            }))
        ));
    }

    #[test]
    fn distributed_members_stay_in_sync() {
        let members = ThreadGroup::new(2).unwrap();
        let config = config(4).build().unwrap();
        let content = dimers(&[0.8, 0.9, 1.0, 1.1, 1.2, 1.3, 1.4, 1.5]);

        let results: Vec<(Vec<f64>, Vec<f64>)> = thread::scope(|scope| {
            let handles: Vec<_> = members
                .iter()
                .map(|member| {
                    let config = &config;
                    let content = &content;
                    scope.spawn(move || {
                        let (train, info) = dataset(content);
                        let (validation, _) = dataset(&dimers(&[0.95, 1.05, 1.25, 1.35]));
                        let mut model = model(&info);
                        let reporter = ProgressReporter::new();
                        let context = TrainingContext {
                            config,
                            communicator: member,
                            reporter: &reporter,
                            checkpoint_dir: None,
                            history_path: None,
                            start_epoch: 0,
                        };
                        let novel = outputs(&model);
                        let summary =
                            run(&mut model, &novel, &mut [train], &mut [validation], &context)
                                .unwrap();
                        let losses = summary.history.iter().map(|m| m.train_loss()).collect();
                        (losses, pair_weights(&model))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let (losses, weights) = &results[0];
        assert_eq!(losses.len(), 4);
        for (other_losses, other_weights) in &results[1..] {
            assert_eq!(losses, other_losses);
            for (a, b) in weights.iter().zip(other_weights) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn failing_member_stops_the_whole_group() {
        let members = ThreadGroup::new(2).unwrap();
        let config = config(3).build().unwrap();

        let results: Vec<Result<TrainingSummary, EngineError>> = thread::scope(|scope| {
            let handles: Vec<_> = members
                .iter()
                .map(|member| {
                    let config = &config;
                    scope.spawn(move || {
                        let (train, info) = dataset(&dimers(&[0.8, 0.9, 1.0, 1.1]));
                        let validation = if member.rank() == 1 {
                            let content =
                                dimers(&[1.0]).replace(r#"["H", "H"]"#, r#"["H", "O"]"#);
                            dataset(&content).0
                        } else {
                            dataset(&dimers(&[1.0])).0
                        };
                        let mut model = model(&info);
                        let reporter = ProgressReporter::new();
                        let context = TrainingContext {
                            config,
                            communicator: member,
                            reporter: &reporter,
                            checkpoint_dir: None,
                            history_path: None,
                            start_epoch: 0,
                        };
                        let novel = outputs(&model);
                        run(&mut model, &novel, &mut [train], &mut [validation], &context)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(matches!(
            results[0],
            Err(EngineError::Distributed(DistributedError::Aborted { rank: 1, .. }))
        ));
        assert!(matches!(results[1], Err(EngineError::Dataset(_))));
    }
}
