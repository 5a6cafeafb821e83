use crate::cli::TrainArgs;
use crate::config::{PartialTrainOptions, TrainOptions, ValidationSource};
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use atomfit::architectures::radial_pair::{ARCHITECTURE_NAME, RadialPairModel};
use atomfit::architectures::{load_trainable, save_model};
use atomfit::core::capabilities::DatasetInfo;
use atomfit::core::io::checkpoint::{CheckpointKind, check_file_extension};
use atomfit::core::io::dataset::read_dataset;
use atomfit::core::models::dataset::Dataset;
use atomfit::engine::data::train_validation_split;
use atomfit::engine::device::string_to_device;
use atomfit::engine::distributed::{AbortOnDrop, Communicator, SingleProcess, ThreadGroup};
use atomfit::engine::error::EngineError;
use atomfit::engine::model::AtomisticModel;
use atomfit::engine::progress::ProgressReporter;
use atomfit::workflows::train::{self, TrainingContext, TrainingOutcome, TrainingSummary};
use candle_core::Device;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{info, warn};

/// Data shared by every member of a training run.
struct RunInputs {
    options: TrainOptions,
    info: DatasetInfo,
    train: Dataset,
    validation: Dataset,
    device: Device,
    output: PathBuf,
    checkpoint_dir: PathBuf,
    history: Option<PathBuf>,
    continue_from: Option<PathBuf>,
}

pub fn run(args: TrainArgs) -> Result<()> {
    let base_dir = args
        .options
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let partial = PartialTrainOptions::from_file(&args.options)?;
    info!("Merging training options from file and CLI arguments...");
    let options = partial.merge_with_cli(&args, &base_dir)?;

    let device = string_to_device(&options.device)
        .map_err(EngineError::from)?
        .into_iter()
        .next()
        .ok_or_else(|| CliError::Argument(format!("No device for '{}'", options.device)))?;

    let (train, validation, info) = load_datasets(&options, &device)?;
    println!(
        "Loaded {} training and {} validation structures.",
        train.len(),
        validation.len()
    );

    let output = check_file_extension(&args.output, "ckpt");
    let checkpoint_dir = args.checkpoint_dir.clone().unwrap_or_else(|| {
        output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    });
    std::fs::create_dir_all(&checkpoint_dir)?;

    let inputs = RunInputs {
        options,
        info,
        train,
        validation,
        device,
        output,
        checkpoint_dir,
        history: args.history.clone(),
        continue_from: args.continue_from.clone(),
    };

    let world_size = inputs.options.world_size;
    let summary = if world_size > 1 {
        info!("Starting distributed training with {world_size} members.");
        run_distributed(&inputs)?
    } else {
        train_member(&inputs, &SingleProcess)?
    };

    match summary.outcome {
        TrainingOutcome::Converged { epoch } => println!("Converged at epoch {epoch}."),
        TrainingOutcome::EarlyStopped { epoch } => println!("Stopped early at epoch {epoch}."),
        TrainingOutcome::MaxEpochs => println!("Reached the maximum number of epochs."),
    }
    println!(
        "✓ Best validation loss {:.4e}, model written to: {}",
        summary.best_validation_loss,
        inputs.output.display()
    );
    Ok(())
}

fn load_datasets(
    options: &TrainOptions,
    device: &Device,
) -> Result<(Dataset, Dataset, DatasetInfo)> {
    let (train, train_info) = read_dataset(&options.train_path, device)?;
    match &options.validation {
        ValidationSource::File(path) => {
            let (validation, validation_info) = read_dataset(path, device)?;
            let info = train_info
                .union(&validation_info)
                .map_err(EngineError::from)?;
            Ok((train, validation, info))
        }
        ValidationSource::Split { fraction } => {
            let (train, validation) =
                train_validation_split(&train, 1.0 - fraction, *fraction, options.seed)?;
            Ok((train, validation, train_info))
        }
    }
}

/// Builds the model of one member: fresh from the options, or restored from
/// a checkpoint and extended with the outputs of the new datasets.
fn build_model(inputs: &RunInputs) -> Result<(RadialPairModel, Vec<String>, usize)> {
    match &inputs.continue_from {
        Some(path) => {
            let (mut model, epoch) =
                load_trainable(path, Some(ARCHITECTURE_NAME), &inputs.device)?;
            if model.hypers() != &inputs.options.hypers {
                warn!(
                    "The architecture options differ from the ones stored in '{}'; the stored \
                     ones are used.",
                    path.display()
                );
            }
            let novel = model.restart(&inputs.info)?;
            Ok((model, novel.into_keys().collect(), epoch.map_or(0, |e| e + 1)))
        }
        None => {
            let model =
                RadialPairModel::new(inputs.options.hypers.clone(), &inputs.info, &inputs.device)
                    .map_err(EngineError::from)?;
            let novel = model.capabilities().outputs.keys().cloned().collect();
            Ok((model, novel, 0))
        }
    }
}

fn train_member(inputs: &RunInputs, communicator: &dyn Communicator) -> Result<TrainingSummary> {
    let abort_guard = AbortOnDrop::new(communicator);
    let (mut model, novel, start_epoch) = build_model(inputs)?;

    let handler = if communicator.is_leader() {
        CliProgressHandler::new()
    } else {
        CliProgressHandler::hidden()
    };
    let reporter = ProgressReporter::with_callback(handler.get_callback());
    let context = TrainingContext {
        config: &inputs.options.training,
        communicator,
        reporter: &reporter,
        checkpoint_dir: Some(&inputs.checkpoint_dir),
        history_path: inputs.history.as_deref(),
        start_epoch,
    };

    let mut train = [inputs.train.clone()];
    let mut validation = [inputs.validation.clone()];
    let summary = train::run(&mut model, &novel, &mut train, &mut validation, &context)?;

    if communicator.is_leader() {
        save_model(
            &model,
            &inputs.output,
            CheckpointKind::Training,
            summary.last_epoch(),
        )?;
        info!(path = %inputs.output.display(), "Saved final model");
    }
    abort_guard.disarm();
    Ok(summary)
}

fn run_distributed(inputs: &RunInputs) -> Result<TrainingSummary> {
    let members = ThreadGroup::new(inputs.options.world_size).map_err(EngineError::from)?;
    let results: Vec<Result<TrainingSummary>> = thread::scope(|scope| {
        let handles: Vec<_> = members
            .iter()
            .map(|member| scope.spawn(move || train_member(inputs, member)))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| handle
                    .join()
                    .unwrap_or_else(|_| Err(CliError::Worker { rank })))
            .collect()
    });

    let mut leader = None;
    for result in results {
        let summary = result?;
        leader.get_or_insert(summary);
    }
    leader.ok_or_else(|| CliError::Config("`training.world-size` must be at least 1".into()))
}
