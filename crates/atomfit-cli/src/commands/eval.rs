use crate::cli::EvalArgs;
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use atomfit::architectures::load_model;
use atomfit::core::capabilities::TargetInfo;
use atomfit::core::io::dataset::read_dataset;
use atomfit::engine::device::string_to_device;
use atomfit::engine::error::EngineError;
use atomfit::engine::progress::ProgressReporter;
use atomfit::workflows::eval;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub fn run(args: EvalArgs) -> Result<()> {
    let device = string_to_device(&args.device)
        .map_err(EngineError::from)?
        .into_iter()
        .next()
        .ok_or_else(|| CliError::Argument(format!("No device for '{}'", args.device)))?;

    info!("Loading model from {:?}", &args.model);
    let model = load_model(&args.model, &device)?;
    let (mut dataset, info) = read_dataset(&args.dataset, &device)?;
    println!("Loaded {} structures from {}.", dataset.len(), args.dataset.display());

    let outputs = &model.capabilities().outputs;
    let targets: BTreeMap<String, TargetInfo> = if info.targets.is_empty() {
        outputs
            .iter()
            .map(|(name, output)| {
                let target = TargetInfo {
                    quantity: output.quantity.clone(),
                    unit: output.unit.clone(),
                    per_atom: output.per_atom,
                    ..TargetInfo::default()
                };
                (name.clone(), target)
            })
            .collect()
    } else {
        for name in info.targets.keys().filter(|name| !outputs.contains_key(*name)) {
            warn!("Target '{name}' is not an output of the model and will be skipped.");
        }
        info.targets
            .into_iter()
            .filter(|(name, _)| outputs.contains_key(name))
            .collect()
    };
    if targets.is_empty() {
        return Err(CliError::Config(
            "none of the dataset targets is an output of the model".to_string(),
        ));
    }

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());
    let report = eval::run(&model, &mut dataset, &targets, args.batch_size, &reporter)?;

    let written = eval::write_predictions(&args.output, &report.predictions)?;
    for path in &written {
        println!("Predictions written to: {}", path.display());
    }
    for (name, value) in &report.metrics {
        println!("{name:>28}: {value:.6e}");
    }
    Ok(())
}
