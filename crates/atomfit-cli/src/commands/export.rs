use crate::cli::ExportArgs;
use crate::error::{CliError, Result};
use atomfit::architectures::load_trainable;
use atomfit::core::io::checkpoint::is_exported_file;
use atomfit::workflows::export;
use candle_core::Device;
use tracing::info;

pub fn run(args: ExportArgs) -> Result<()> {
    if is_exported_file(&args.checkpoint) {
        return Err(CliError::Argument(format!(
            "'{}' is already an exported model",
            args.checkpoint.display()
        )));
    }

    info!("Loading checkpoint from {:?}", &args.checkpoint);
    let (model, _) = load_trainable(&args.checkpoint, None, &Device::Cpu)?;
    let path = export::run(&model, &args.output)?;
    println!("Model exported to: {}", path.display());
    Ok(())
}
